use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBand {
    Young,
    Adult,
    Mature,
    Senior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accent {
    American,
    British,
    Australian,
    Irish,
    Canadian,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Professional,
    Friendly,
    Casual,
    Warm,
    Calm,
    Energetic,
    Authoritative,
}

impl Gender {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "female" | "woman" | "women" | "girl" | "lady" | "f" => Some(Gender::Female),
            "male" | "man" | "men" | "boy" | "guy" | "m" => Some(Gender::Male),
            "neutral" | "androgynous" => Some(Gender::Neutral),
            _ => None,
        }
    }
}

impl AgeBand {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "young" | "youthful" | "teen" | "child" => Some(AgeBand::Young),
            "adult" | "middle" | "middle-aged" => Some(AgeBand::Adult),
            "mature" | "older" | "experienced" => Some(AgeBand::Mature),
            "senior" | "old" | "elderly" => Some(AgeBand::Senior),
            _ => None,
        }
    }
}

impl Accent {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "american" | "us" | "usa" => Some(Accent::American),
            "british" | "uk" | "gb" | "english" => Some(Accent::British),
            "australian" | "aussie" | "au" => Some(Accent::Australian),
            "irish" | "ie" => Some(Accent::Irish),
            "canadian" | "ca" => Some(Accent::Canadian),
            _ => None,
        }
    }
}

impl Style {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "professional" | "business" | "formal" => Some(Style::Professional),
            "friendly" | "cheerful" => Some(Style::Friendly),
            "casual" | "relaxed" => Some(Style::Casual),
            "warm" | "gentle" => Some(Style::Warm),
            "calm" | "soothing" => Some(Style::Calm),
            "energetic" | "excited" | "upbeat" => Some(Style::Energetic),
            "authoritative" | "serious" | "confident" => Some(Style::Authoritative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceCharacteristics {
    pub gender: Gender,
    pub age_band: AgeBand,
    pub accent: Accent,
    pub style: Style,
}

/// Backend-agnostic voice descriptor. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceIdentity {
    pub generic_id: String,
    pub display_name: String,
    pub characteristics: VoiceCharacteristics,
    /// 0.0 – 10.0
    pub quality_score: f32,
    pub backend_voice_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub supported_languages: Vec<String>,
    /// Older identifiers callers may still send (pre-generic naming).
    #[serde(default)]
    pub legacy_ids: Vec<String>,
}

/// Read-only table of voice identities plus the reverse indexes used for lookup.
///
/// Built once at startup; every lookup afterwards is a plain map read, so the registry
/// can be shared across tasks behind an `Arc` without locking.
#[derive(Debug)]
pub struct VoiceRegistry {
    voices: Vec<VoiceIdentity>,
    by_id: HashMap<String, usize>,
    by_native_id: HashMap<String, usize>,
}

impl VoiceRegistry {
    pub fn new(voices: Vec<VoiceIdentity>) -> GatewayResult<Self> {
        if voices.is_empty() {
            return Err(GatewayError::Registry(
                "voice catalogue must contain at least one identity".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (idx, voice) in voices.iter().enumerate() {
            if voice.generic_id.trim().is_empty() {
                return Err(GatewayError::Registry(format!(
                    "voice #{} has an empty generic_id",
                    idx
                )));
            }
            if !(0.0..=10.0).contains(&voice.quality_score) {
                return Err(GatewayError::Registry(format!(
                    "voice '{}' has quality_score {} outside 0-10",
                    voice.generic_id, voice.quality_score
                )));
            }
            if !seen.insert(voice.generic_id.to_lowercase()) {
                return Err(GatewayError::Registry(format!(
                    "duplicate generic_id '{}'",
                    voice.generic_id
                )));
            }
        }

        Ok(Self::index(voices))
    }

    fn index(voices: Vec<VoiceIdentity>) -> Self {
        let by_id: HashMap<String, usize> = voices
            .iter()
            .enumerate()
            .map(|(idx, voice)| (voice.generic_id.to_lowercase(), idx))
            .collect();
        let mut by_native_id: HashMap<String, usize> = HashMap::new();

        // Native IDs never shadow a generic ID.
        for (idx, voice) in voices.iter().enumerate() {
            let natives = voice
                .backend_voice_ids
                .values()
                .chain(voice.legacy_ids.iter());
            for native in natives {
                let key = native.to_lowercase();
                if key.is_empty() || by_id.contains_key(&key) {
                    continue;
                }
                // First identity to claim a native ID owns it.
                if let Some(owner) = by_native_id.get(&key) {
                    debug!(
                        native_id = %native,
                        owner = %voices[*owner].generic_id,
                        ignored = %voice.generic_id,
                        "Native voice ID already mapped"
                    );
                    continue;
                }
                by_native_id.insert(key, idx);
            }
        }

        Self {
            voices,
            by_id,
            by_native_id,
        }
    }

    /// Loads a JSON array of `VoiceIdentity` records.
    pub fn from_json_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let voices: Vec<VoiceIdentity> = serde_json::from_str(&content)?;
        info!(
            path = %path.as_ref().display(),
            count = voices.len(),
            "Loaded voice catalogue"
        );
        Self::new(voices)
    }

    pub fn get(&self, generic_id: &str) -> Option<&VoiceIdentity> {
        self.by_id
            .get(&generic_id.to_lowercase())
            .map(|idx| &self.voices[*idx])
    }

    /// Reverse lookup for backend-native or legacy IDs.
    pub fn find_by_native_id(&self, native_id: &str) -> Option<&VoiceIdentity> {
        self.by_native_id
            .get(&native_id.to_lowercase())
            .map(|idx| &self.voices[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &VoiceIdentity> {
        self.voices.iter()
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// The catalogue shipped with the gateway.
    pub fn builtin() -> Self {
        Self::index(builtin_voices())
    }
}

#[allow(clippy::too_many_arguments)]
fn identity(
    generic_id: &str,
    display_name: &str,
    characteristics: (Gender, AgeBand, Accent, Style),
    quality_score: f32,
    ids: [(&str, &str); 4],
    languages: &[&str],
    legacy: &[&str],
) -> VoiceIdentity {
    let (gender, age_band, accent, style) = characteristics;
    VoiceIdentity {
        generic_id: generic_id.to_string(),
        display_name: display_name.to_string(),
        characteristics: VoiceCharacteristics {
            gender,
            age_band,
            accent,
            style,
        },
        quality_score,
        backend_voice_ids: ids
            .iter()
            .map(|(backend, id)| (backend.to_string(), id.to_string()))
            .collect(),
        supported_languages: languages.iter().map(|l| l.to_string()).collect(),
        legacy_ids: legacy.iter().map(|l| l.to_string()).collect(),
    }
}

fn builtin_voices() -> Vec<VoiceIdentity> {
    use AgeBand::*;
    use Gender::*;

    vec![
        identity(
            "american_female_professional",
            "Jenny",
            (Female, Adult, Accent::American, Style::Professional),
            9.0,
            [
                ("edge", "en-US-JennyNeural"),
                ("piper", "en_US-lessac-medium"),
                ("espeak", "en-us+f3"),
                ("remote", "jenny"),
            ],
            &["en-US"],
            &["pam_female_professional"],
        ),
        identity(
            "american_male_professional",
            "Guy",
            (Male, Adult, Accent::American, Style::Professional),
            8.5,
            [
                ("edge", "en-US-GuyNeural"),
                ("piper", "en_US-ryan-medium"),
                ("espeak", "en-us+m3"),
                ("remote", "guy"),
            ],
            &["en-US"],
            &["pam_male_professional"],
        ),
        identity(
            "american_female_friendly",
            "Aria",
            (Female, Young, Accent::American, Style::Friendly),
            8.8,
            [
                ("edge", "en-US-AriaNeural"),
                ("piper", "en_US-amy-medium"),
                ("espeak", "en-us+f2"),
                ("remote", "aria"),
            ],
            &["en-US"],
            &["pam_female_friendly"],
        ),
        identity(
            "american_male_calm",
            "Davis",
            (Male, Mature, Accent::American, Style::Calm),
            8.2,
            [
                ("edge", "en-US-DavisNeural"),
                ("piper", "en_US-joe-medium"),
                ("espeak", "en-us+m1"),
                ("remote", "davis"),
            ],
            &["en-US"],
            &["pam_male_calm"],
        ),
        identity(
            "british_female_professional",
            "Sonia",
            (Female, Adult, Accent::British, Style::Professional),
            8.7,
            [
                ("edge", "en-GB-SoniaNeural"),
                ("piper", "en_GB-alba-medium"),
                ("espeak", "en-gb+f3"),
                ("remote", "sonia"),
            ],
            &["en-GB"],
            &["bella_british_professional"],
        ),
        identity(
            "british_male_authoritative",
            "Ryan",
            (Male, Mature, Accent::British, Style::Authoritative),
            8.4,
            [
                ("edge", "en-GB-RyanNeural"),
                ("piper", "en_GB-alan-medium"),
                ("espeak", "en-gb+m3"),
                ("remote", "ryan"),
            ],
            &["en-GB"],
            &["bella_british_authoritative"],
        ),
        identity(
            "australian_female_friendly",
            "Natasha",
            (Female, Adult, Accent::Australian, Style::Friendly),
            8.6,
            [
                ("edge", "en-AU-NatashaNeural"),
                ("piper", "en_GB-jenny_dioco-medium"),
                ("espeak", "en+f4"),
                ("remote", "natasha"),
            ],
            &["en-AU", "en-NZ"],
            &["matilda_aussie_friendly"],
        ),
        identity(
            "australian_male_casual",
            "William",
            (Male, Adult, Accent::Australian, Style::Casual),
            8.0,
            [
                ("edge", "en-AU-WilliamNeural"),
                ("piper", "en_GB-northern_english_male-medium"),
                ("espeak", "en+m4"),
                ("remote", "william"),
            ],
            &["en-AU", "en-NZ"],
            &["matilda_aussie_casual"],
        ),
        identity(
            "irish_female_warm",
            "Emily",
            (Female, Adult, Accent::Irish, Style::Warm),
            8.1,
            [
                ("edge", "en-IE-EmilyNeural"),
                ("piper", "en_GB-semaine-medium"),
                ("espeak", "en-gb+f4"),
                ("remote", "emily"),
            ],
            &["en-IE"],
            &[],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalogue_is_valid() {
        assert!(VoiceRegistry::new(builtin_voices()).is_ok());
        let registry = VoiceRegistry::builtin();
        assert_eq!(registry.len(), 9);
        assert!(registry.get("american_female_professional").is_some());
    }

    #[test]
    fn test_native_and_legacy_ids_reverse_map() {
        let registry = VoiceRegistry::builtin();
        let by_native = registry.find_by_native_id("en-US-JennyNeural").unwrap();
        let by_legacy = registry.find_by_native_id("pam_female_professional").unwrap();
        assert_eq!(by_native.generic_id, by_legacy.generic_id);
        assert_eq!(by_native.generic_id, "american_female_professional");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = VoiceRegistry::builtin();
        assert!(registry.get("British_Female_Professional").is_some());
        assert!(registry.find_by_native_id("en-gb-soniaNEURAL").is_some());
    }

    #[test]
    fn test_duplicate_generic_id_rejected() {
        let mut voices = builtin_voices();
        voices.push(voices[0].clone());
        assert!(matches!(
            VoiceRegistry::new(voices),
            Err(GatewayError::Registry(_))
        ));
    }

    #[test]
    fn test_empty_catalogue_rejected() {
        assert!(VoiceRegistry::new(Vec::new()).is_err());
    }

    #[test]
    fn test_shared_native_id_owned_by_first_identity() {
        let mut voices = builtin_voices();
        voices[1]
            .backend_voice_ids
            .insert("espeak".to_string(), "en-us+f3".to_string());
        let registry = VoiceRegistry::new(voices).unwrap();
        assert_eq!(
            registry.find_by_native_id("en-us+f3").unwrap().generic_id,
            "american_female_professional"
        );
    }

    #[test]
    fn test_quality_out_of_range_rejected() {
        let mut voices = builtin_voices();
        voices[0].quality_score = 11.0;
        assert!(VoiceRegistry::new(voices).is_err());
    }

    #[test]
    fn test_token_parsers() {
        assert_eq!(Gender::from_token("woman"), Some(Gender::Female));
        assert_eq!(AgeBand::from_token("elderly"), Some(AgeBand::Senior));
        assert_eq!(Accent::from_token("aussie"), Some(Accent::Australian));
        assert_eq!(Style::from_token("business"), Some(Style::Professional));
        assert_eq!(Style::from_token("purple"), None);
    }
}
