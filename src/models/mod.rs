pub mod reading;
pub mod session;
pub mod window;

pub use reading::{
    parse_timestamp_ms, Axis3, BufferedRecord, FootData, FootSide, InertialData, Orientation,
    Reading, ReadingData, StreamKind, FOOT_VALUE_COUNT, INERTIAL_VALUE_COUNT,
};
pub use session::{SessionHandle, SessionInfo, SessionStatus};
pub use window::{SensorWindow, VectorPoint, WindowPayload};
