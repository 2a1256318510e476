// Minimal HTML escaping for values interpolated into the error page.
fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// Error page served when no tunnel is registered for the requested host.
pub(crate) fn bad_gateway_html(hostname: &str) -> String {
    let hostname = escape_html(hostname);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Error 502 - {hostname}</title>
    <style>
        .center {{
            text-align: center;
        }}
    </style>
</head>
<body>
<div class="center">
    <h1>Error 502 - Bad Gateway</h1>
    <p>No tunnel is registered for <b>{hostname}</b>.</p>
</div>
</body>
</html>
"#
    )
}
