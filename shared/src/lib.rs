pub mod decimal;
pub mod event;
pub mod models;
pub mod schema;
pub mod telemetry;

pub use decimal::{decode_decimal, DecimalEncoding};
pub use event::{ChangeEvent, DecodeError, Decoder, Operation, TransactionFields};
pub use models::EnrichedRecord;
