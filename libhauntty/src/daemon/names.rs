// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Generates a human-readable session name for an unnamed `Create` request.

use rand::Rng;

use crate::consts;

const ADJECTIVES: &[&str] = &[
    "quiet", "brisk", "amber", "lucid", "hollow", "sturdy", "restless", "gentle", "faint",
    "vivid", "dusty", "crisp", "plain", "bold", "quick", "calm", "narrow", "broad", "steep",
    "slow",
];

const NOUNS: &[&str] = &[
    "falcon", "harbor", "meadow", "thicket", "ember", "basin", "ridge", "willow", "lantern",
    "canyon", "otter", "terrace", "pebble", "marsh", "glacier", "orchard", "grove", "summit",
    "hollow", "brook",
];

/// Produces a name of the form `<adjective>-<noun>`, retrying up to
/// `NAME_GEN_RETRIES` times to dodge a collision with `taken` before
/// appending a random 0-999 numeric suffix.
pub fn generate(taken: &dyn Fn(&str) -> bool) -> String {
    let mut rng = rand::thread_rng();
    for _ in 0..consts::NAME_GEN_RETRIES {
        let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
        let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
        let candidate = format!("{}-{}", adjective, noun);
        if !taken(&candidate) {
            return candidate;
        }
    }
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{}-{}-{}", adjective, noun, rng.gen_range(0..1000))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generate_avoids_taken_names() {
        let name = generate(&|n| n == "quiet-falcon");
        assert_ne!(name, "quiet-falcon");
    }

    #[test]
    fn generate_produces_adjective_noun_shape() {
        let name = generate(&|_| false);
        assert_eq!(name.split('-').count(), 2);
    }
}
