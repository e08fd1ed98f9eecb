//! Capture sessionization and featurization.
pub mod analyser;
pub mod config;
pub mod error;
pub mod ui;

pub use analyser::containers::{CaptureSource, Endpoint, MacAddr, PacketRecord, RunningRepresentation, SessionBin, SessionKey};
pub use analyser::core::{analyse, analyse_captures, update_running, BinReport, CaptureReport};
pub use analyser::store::{MemoryStore, RepresentationStore, RepresentationUpdater};
pub use analyser::features::{extract_features, Features};
pub use analyser::fusion::fuse;
pub use analyser::sessions::sessionize;
pub use analyser::source::resolve_source;
pub use analyser::utils::{CapturePacketSource, FixtureSource, TsharkSource};
pub use config::{AddressType, PipelineConfig};
pub use error::{Error, Result};
