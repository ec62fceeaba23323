//! Wire protocol version. Bumped on incompatible changes to the command
//! set or argument encoding; agents and the controller refuse to talk
//! to a peer whose major version differs (see `VERSION` in the
//! transport command set).
pub const PROTOCOL_MAJOR_VERSION: u32 = 1;
