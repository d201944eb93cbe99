mod messages;
mod xdr;

pub use messages::AddressBitmapMsg;
pub use messages::DataHeader;
pub use messages::FunctionMsg;
pub use messages::SampleData;
pub use messages::StatementMsg;
pub use messages::SymbolTableMsg;
pub use messages::RANK_UNRESOLVED;

pub use xdr::{DecodeError, Decoder, Encoder};
