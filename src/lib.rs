//! speechd-gateway: turns "speak this text as this voice" into audio by walking a ranked
//! list of synthesis engines, guarded by per-engine circuit breakers and health tracking.

pub mod backends;
pub mod breaker;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config_loader;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod recovery;
pub mod resolver;
pub mod retry;
pub mod text;
pub mod voices;

pub use classifier::{ClassifiedError, ErrorClassifier, ErrorKind, Severity};
pub use error::{GatewayError, GatewayResult};
pub use orchestrator::{GatewayStatus, Quality, SynthesisOrchestrator, SynthesisRequest, SynthesisResponse};
pub use resolver::{RequestContext, VoiceResolver};
pub use voices::{VoiceIdentity, VoiceRegistry};
