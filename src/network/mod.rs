//! Wire encoding for values that cross node boundaries.

pub mod codec;

pub use codec::{Serializer, StringSerializer, TokenSerializer, MAX_STRING_LEN};
