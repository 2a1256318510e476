use rand::seq::IndexedRandom;

// Word lists for generated subdomains. Kept small on purpose: collisions are
// retried by the registry, and the labels only need to be memorable enough
// to read back over the phone.
const ADJECTIVES: &[&str] = &[
    "able", "acid", "airy", "ample", "aqua", "azure", "bold", "brave", "brief", "bright", "busy",
    "calm", "civil", "clear", "clever", "cosmic", "crisp", "daring", "deep", "dewy", "eager",
    "early", "fancy", "fast", "fine", "fond", "free", "fresh", "gentle", "glad", "grand", "green",
    "happy", "hardy", "humble", "jolly", "keen", "kind", "late", "lively", "lucky", "mellow",
    "merry", "mild", "neat", "noble", "plain", "proud", "quick", "quiet", "rapid", "rare", "ripe",
    "royal", "shiny", "smart", "snug", "solid", "sunny", "swift", "tidy", "vivid", "warm", "wise",
];

const NOUNS: &[&str] = &[
    "acorn", "anchor", "aspen", "badger", "bay", "beacon", "birch", "breeze", "brook", "canyon",
    "cedar", "cliff", "cloud", "comet", "coral", "crane", "creek", "delta", "dune", "falcon",
    "fern", "fjord", "flint", "forest", "fox", "garnet", "glade", "grove", "harbor", "hawk",
    "heron", "hill", "island", "jasper", "lagoon", "lark", "lynx", "maple", "meadow", "moose",
    "otter", "owl", "pebble", "pine", "plume", "pond", "prairie", "quartz", "raven", "reef",
    "ridge", "river", "shore", "sparrow", "spruce", "stone", "summit", "thicket", "trail", "tundra",
    "valley", "willow", "wolf", "wren",
];

// Picks an `adjective-noun` label, used whenever a client does not supply a
// usable subdomain of its own.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SubdomainGenerator;

impl SubdomainGenerator {
    pub(crate) fn generate(&self) -> String {
        let mut rng = rand::rng();
        let adjective = ADJECTIVES.choose(&mut rng).expect("word list is not empty");
        let noun = NOUNS.choose(&mut rng).expect("word list is not empty");
        format!("{adjective}-{noun}")
    }
}
