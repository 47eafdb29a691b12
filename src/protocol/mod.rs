//! Frame codecs of the two boot mode wire grammars.

pub mod framed;
pub mod legacy;

pub use self::framed::{Frame, FramedLink};
pub use self::legacy::{Command, EraseTarget, LegacyLink, SizeField};
