use crate::voices::{AgeBand, Accent, Gender, Style, VoiceIdentity, VoiceRegistry};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-request hints used when the voice input itself doesn't pin an identity.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Usage context such as "travel_planning", "financial" or "emergency".
    pub usage: Option<String>,
    /// ISO country/region code ("AU", "US", ...).
    pub region: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Which resolution rule produced the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    GenericId,
    NativeId,
    Characteristics,
    Context,
    Region,
    Default,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedVoice<'a> {
    pub identity: &'a VoiceIdentity,
    pub source: ResolutionSource,
}

/// Voice ID an engine is guaranteed to accept when an identity has no mapping for it.
pub fn fallback_voice_for(backend: &str) -> &'static str {
    match backend {
        "edge" => "en-US-JennyNeural",
        "piper" => "en_US-lessac-medium",
        "espeak" => "en",
        _ => "default",
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CharacteristicQuery {
    gender: Option<Gender>,
    age_band: Option<AgeBand>,
    accent: Option<Accent>,
    style: Option<Style>,
}

impl CharacteristicQuery {
    fn parse(input: &str) -> Option<Self> {
        let mut query = CharacteristicQuery::default();
        let lowered = input.to_lowercase();
        let tokens = lowered
            .split(|c: char| c.is_whitespace() || c == ',' || c == '_' || c == '/')
            .filter(|t| !t.is_empty());

        for token in tokens {
            if query.gender.is_none() {
                if let Some(g) = Gender::from_token(token) {
                    query.gender = Some(g);
                    continue;
                }
            }
            if query.age_band.is_none() {
                if let Some(a) = AgeBand::from_token(token) {
                    query.age_band = Some(a);
                    continue;
                }
            }
            if query.accent.is_none() {
                if let Some(a) = Accent::from_token(token) {
                    query.accent = Some(a);
                    continue;
                }
            }
            if query.style.is_none() {
                if let Some(s) = Style::from_token(token) {
                    query.style = Some(s);
                }
            }
        }

        let any = query.gender.is_some()
            || query.age_band.is_some()
            || query.accent.is_some()
            || query.style.is_some();
        any.then_some(query)
    }

    /// Weighted token matches; 0 means nothing matched.
    fn matches(&self, voice: &VoiceIdentity) -> u32 {
        let c = &voice.characteristics;
        let mut score = 0;
        if self.gender == Some(c.gender) {
            score += 4;
        }
        if self.style == Some(c.style) {
            score += 4;
        }
        if self.age_band == Some(c.age_band) {
            score += 2;
        }
        if self.accent == Some(c.accent) {
            score += 1;
        }
        score
    }
}

/// Maps arbitrary voice input onto a generic identity, then onto an engine's own voice ID.
///
/// Resolution never fails: anything unrecognised degrades to a configured default.
pub struct VoiceResolver {
    registry: Arc<VoiceRegistry>,
    default_voice: String,
    context_voices: HashMap<String, String>,
    region_voices: HashMap<String, String>,
}

impl VoiceResolver {
    pub fn new(
        registry: Arc<VoiceRegistry>,
        default_voice: impl Into<String>,
        context_voices: HashMap<String, String>,
        region_voices: HashMap<String, String>,
    ) -> Self {
        let default_voice = default_voice.into();
        if registry.get(&default_voice).is_none() {
            warn!(
                voice = %default_voice,
                "Default voice is not in the catalogue; first catalogue entry will be used"
            );
        }
        Self {
            registry,
            default_voice,
            context_voices: context_voices
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            region_voices: region_voices
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect(),
        }
    }

    pub fn registry(&self) -> &Arc<VoiceRegistry> {
        &self.registry
    }

    pub fn resolve(&self, input: Option<&str>, context: &RequestContext) -> &VoiceIdentity {
        self.resolve_with_source(input, context).identity
    }

    pub fn resolve_with_source(
        &self,
        input: Option<&str>,
        context: &RequestContext,
    ) -> ResolvedVoice<'_> {
        let input = input.map(str::trim).filter(|s| !s.is_empty());

        if let Some(input) = input {
            if let Some(identity) = self.registry.get(input) {
                return self.resolved(identity, ResolutionSource::GenericId, input);
            }
            if let Some(identity) = self.registry.find_by_native_id(input) {
                return self.resolved(identity, ResolutionSource::NativeId, input);
            }
            if let Some(identity) = self.best_characteristic_match(input) {
                return self.resolved(identity, ResolutionSource::Characteristics, input);
            }
        }

        if let Some(identity) = context
            .usage
            .as_deref()
            .and_then(|usage| self.context_voices.get(&usage.trim().to_lowercase()))
            .and_then(|id| self.registry.get(id))
        {
            return self.resolved(identity, ResolutionSource::Context, input.unwrap_or(""));
        }

        if let Some(identity) = context
            .region
            .as_deref()
            .and_then(|region| self.region_voices.get(&region.trim().to_uppercase()))
            .and_then(|id| self.registry.get(id))
        {
            return self.resolved(identity, ResolutionSource::Region, input.unwrap_or(""));
        }

        self.resolved(self.default_identity(), ResolutionSource::Default, input.unwrap_or(""))
    }

    pub fn default_identity(&self) -> &VoiceIdentity {
        self.registry
            .get(&self.default_voice)
            .or_else(|| self.registry.iter().next())
            .expect("voice registry is never empty")
    }

    /// Engine-specific voice ID for an identity. Never empty.
    pub fn backend_voice_id(&self, identity: &VoiceIdentity, backend: &str) -> String {
        match identity.backend_voice_ids.get(backend) {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => {
                debug!(
                    voice = %identity.generic_id,
                    backend,
                    "No voice mapping for backend; using engine fallback"
                );
                fallback_voice_for(backend).to_string()
            }
        }
    }

    fn best_characteristic_match(&self, input: &str) -> Option<&VoiceIdentity> {
        let query = CharacteristicQuery::parse(input)?;

        let mut best: Option<(f32, &VoiceIdentity)> = None;
        for voice in self.registry.iter() {
            let matched = query.matches(voice);
            if matched == 0 {
                continue;
            }
            let score = matched as f32 + voice.quality_score * 0.01;
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, voice));
            }
        }
        best.map(|(_, voice)| voice)
    }

    fn resolved<'a>(
        &self,
        identity: &'a VoiceIdentity,
        source: ResolutionSource,
        input: &str,
    ) -> ResolvedVoice<'a> {
        debug!(input, voice = %identity.generic_id, ?source, "Resolved voice");
        ResolvedVoice { identity, source }
    }
}
