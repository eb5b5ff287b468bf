pub mod compositor;
pub mod control;
pub mod error;
pub mod live;
pub mod media;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;
pub mod source;

pub use compositor::{CompositeFrame, CompositorConfig};
pub use error::{MosaicError, Result};
pub use live::{LiveLoop, LoopConfig, LoopExit, RunningLoop};
pub use registry::{Channel, ChannelRegistry};
pub use server::{ControlServer, ServerConfig};
pub use session::{
    OutputTarget, Protocol, SessionConfig, SessionInfo, SessionManager, SessionState, StartRequest,
};
pub use sink::{EncoderSettings, OutputSink, PushOutcome, SessionArtifact, SinkContext, SinkFactory, SinkReady};
pub use source::{Decoder, DecoderFactory, FrameSource, SourceFrame, SourceSettings};
