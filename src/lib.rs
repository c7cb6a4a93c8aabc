// polykb - host-side driver core for polykb programmable keyboards
// Key input processing, device model registry, and layout tables

pub mod combo;
pub mod key_machine;
pub mod layout;
pub mod morse;
pub mod registry;
pub mod sequence;

pub use combo::{match_combo, ComboDef};
pub use key_machine::{Action, InputSink, KeyMachine, KeyMachineConfig};
pub use layout::{is_modifier, shift_rewrite, KeyLayout};
pub use morse::{decode as decode_morse, MorseSymbol, CHAR_GAP, DOT_DASH_THRESHOLD};
pub use registry::{find as find_model, DeviceModel, MODELS};
pub use sequence::{SequenceActions, SequenceDef};

pub use polykb_device::{Device, DeviceConfig, DeviceError, KeyEvent};
pub use polykb_transport::{Endianness, LegacyCodec, RawCodec, TransportKind};
