//! Suggested workspace names.

use rand::seq::IndexedRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "clever", "crisp", "daring", "eager", "fancy", "gentle", "happy", "icy",
    "jolly", "keen", "lively", "lucky", "mellow", "nimble", "polite", "quiet", "rapid", "shiny",
    "steady", "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "comet", "falcon", "fjord", "gecko", "harbor", "heron", "island",
    "lantern", "lynx", "meadow", "otter", "panda", "pebble", "quartz", "raven", "river", "sparrow",
    "summit", "tiger", "tundra", "walrus", "willow", "yak",
];

/// A random `adjective-noun` name.
pub fn generate_workspace_name() -> String {
    generate_with(&mut rand::rng())
}

/// Same as [`generate_workspace_name`] with a caller-supplied generator.
pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("new");
    let noun = NOUNS.choose(rng).copied().unwrap_or("workspace");
    format!("{adjective}-{noun}")
}
