// bcp-protocol: Backbox Control Protocol wire layer.
//
// BCP is a line-oriented, URL-style text protocol. One message per
// `\n`-terminated line of the shape `command?k1=v1&k2=v2`, with percent
// encoded parameter values carrying type-tag prefixes so that typed scalars
// survive the text wire. A trailing `&bytes=<N>` on a header declares that
// exactly N bytes of raw binary payload follow the newline.
//
// This crate is pure wire mechanics: no sockets, no routing policy.

pub mod codec;
pub mod framer;
pub mod value;

pub use codec::{CodecError, decode_command_string, encode_command_string};
pub use framer::{BcpFramer, RawFrame};
pub use value::{ParamMap, Value};

/// Advisory protocol version exchanged in the `hello` handshake.
pub const BCP_VERSION: &str = "1.0";
