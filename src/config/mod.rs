pub mod settings;

pub use settings::{
    ClientSettings,
    Config,
    OutputSettings,
    PollerSettings,
    ServerSettings,
    TelemetrySettings,
};
