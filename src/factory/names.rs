//! Human-friendly project names.

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "cosmic", "crisp", "dapper", "eager", "fancy",
    "gentle", "golden", "happy", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "proud",
    "quiet", "rapid", "shiny", "snappy", "sunny", "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "comet", "falcon", "forest", "galaxy", "harbor", "island",
    "lagoon", "lantern", "meadow", "nebula", "otter", "panda", "pebble", "pine", "quartz",
    "raven", "river", "rocket", "sparrow", "summit", "tiger", "tulip", "valley", "voyage",
    "willow", "yak", "zephyr",
];

/// Two title-case words, e.g. "Brisk Falcon".
pub fn generate_project_name() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    name_from_seed(
        u16::from_le_bytes([bytes[0], bytes[1]]),
        u16::from_le_bytes([bytes[2], bytes[3]]),
    )
}

fn name_from_seed(a: u16, b: u16) -> String {
    let adjective = ADJECTIVES[a as usize % ADJECTIVES.len()];
    let noun = NOUNS[b as usize % NOUNS.len()];
    format!("{} {}", title_case(adjective), title_case(noun))
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
