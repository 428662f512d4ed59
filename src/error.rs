use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] ron::error::SpannedError),

    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] ron::Error),

    #[error("Failed to initialize MIDI: {0}")]
    MidiInit(String),

    #[error("No MIDI port found matching: {0}")]
    MidiPortNotFound(String),

    #[error("Failed to connect to MIDI port: {0}")]
    MidiConnect(String),

    #[error("OSC encode error: {0}")]
    OscEncode(String),

    #[error("OSC decode error: {0}")]
    OscDecode(String),

    #[error("Could not resolve network address: {0}")]
    Address(String),

    #[error("Bridge is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
