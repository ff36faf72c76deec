//! Binary framing of relay messages.
//!
//! A relay message travels through the PAM binary prompt as a pointer to a C struct laid out as
//! follows:
//!
//! ```text
//! struct {
//!     struct { uint32_t length; unsigned char type; } header;  // length is big-endian
//!     char protocol_name[64];
//!     unsigned int version;
//!     char *json;                                               // NUL terminated, may be NULL
//! };
//! ```
//!
//! Both the struct and the JSON string are allocated with `malloc` so that whichever side ends up
//! owning a message can release it with `free`. [`BinaryMessage`] is the owning guard for such an
//! allocation.

use libc::{c_char, c_uint, c_void};
use std::{
    ffi::{CStr, CString, NulError},
    fmt, mem,
    ptr::{self, NonNull},
};
use thiserror::Error;

/// Width of the protocol name field, including its NUL terminator.
pub const PROTOCOL_NAME_LEN: usize = 64;

#[repr(C)]
struct RawHeader {
    length: u32,
    kind: u8,
}

#[repr(C)]
struct RawMessage {
    header: RawHeader,
    protocol_name: [c_char; PROTOCOL_NAME_LEN],
    version: c_uint,
    json: *mut c_char,
}

const MESSAGE_SIZE: usize = mem::size_of::<RawMessage>();

/// The name and version a relay message is stamped with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolInfo {
    name: &'static str,
    version: u32,
}

impl ProtocolInfo {
    /// Creates a protocol description.
    ///
    /// # Panics
    ///
    /// When `name` does not fit the header or contains a NUL byte. Used in a `const` item this
    /// turns into a compile error.
    pub const fn new(name: &'static str, version: u32) -> Self {
        let bytes = name.as_bytes();
        assert!(bytes.len() < PROTOCOL_NAME_LEN, "protocol name exceeds the header width");
        let mut i = 0;
        while i < bytes.len() {
            assert!(bytes[i] != 0, "protocol name contains a nul byte");
            i += 1;
        }
        ProtocolInfo { name, version }
    }

    /// The protocol name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The protocol version
    pub fn version(&self) -> u32 {
        self.version
    }
}

/// The protocol spoken with the graphical login manager.
pub const JSON_PROTOCOL: ProtocolInfo = ProtocolInfo::new("com.ubuntu.authd.gdm", 1);

/// Errors produced while framing or unframing relay messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer stamped its message with another protocol.
    #[error("protocol name or version mismatch: got {got_name} v{got_version}, expected {expected_name} v{expected_version}")]
    ProtocolMismatch {
        /// Name found in the message
        got_name: String,
        /// Version found in the message
        got_version: u32,
        /// Name this side speaks
        expected_name: &'static str,
        /// Version this side speaks
        expected_version: u32,
    },
    /// The header length does not describe a relay message.
    #[error("unexpected message length {got}, expected {expected}")]
    InvalidLength {
        /// Length found in the header
        got: usize,
        /// Size of a relay message
        expected: usize,
    },
    /// The payload can not be carried as a C string.
    #[error("payload can not be encoded: {0}")]
    InteriorNul(#[from] NulError),
    /// `malloc` failed.
    #[error("could not allocate relay message")]
    Allocation,
}

/// An owned relay message.
///
/// Dropping it releases the JSON payload first and the message itself afterwards, on every path.
pub struct BinaryMessage {
    raw: NonNull<RawMessage>,
}

// The message is plain heap memory with no thread affinity.
unsafe impl Send for BinaryMessage {}

impl BinaryMessage {
    fn alloc(protocol: &ProtocolInfo, kind: u8, payload: Option<&[u8]>) -> Result<Self, CodecError> {
        let json = match payload {
            None => ptr::null_mut(),
            Some(bytes) => {
                let cstring = CString::new(bytes)?;
                let copy = unsafe { libc::strdup(cstring.as_ptr()) };
                if copy.is_null() {
                    return Err(CodecError::Allocation);
                }
                copy
            }
        };

        let raw = unsafe { libc::calloc(1, MESSAGE_SIZE) } as *mut RawMessage;
        let Some(raw) = NonNull::new(raw) else {
            unsafe { libc::free(json as *mut c_void) };
            return Err(CodecError::Allocation);
        };

        // calloc zeroed the name field, so it stays NUL terminated.
        unsafe {
            let msg = raw.as_ptr();
            (*msg).header.length = (MESSAGE_SIZE as u32).to_be();
            (*msg).header.kind = kind;
            for (dst, src) in (*msg).protocol_name.iter_mut().zip(protocol.name.bytes()) {
                *dst = src as c_char;
            }
            (*msg).version = protocol.version as c_uint;
            (*msg).json = json;
        }
        Ok(BinaryMessage { raw })
    }

    /// Takes ownership of a message allocated on the other side of the conversation.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a `malloc`ed relay message whose `json` member is null or a
    /// `malloc`ed NUL terminated string. Ownership of both moves to the returned value.
    pub(crate) unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr as *mut RawMessage).map(|raw| BinaryMessage { raw })
    }

    /// Releases ownership, returning the pointer to hand over to C.
    #[cfg(test)]
    pub(crate) fn into_raw(self) -> *mut c_void {
        let ptr = self.raw.as_ptr() as *mut c_void;
        mem::forget(self);
        ptr
    }

    /// The pointer to pass as a binary prompt. Ownership stays with `self`.
    pub(crate) fn as_ptr(&self) -> *const c_void {
        self.raw.as_ptr() as *const c_void
    }

    fn raw(&self) -> &RawMessage {
        unsafe { self.raw.as_ref() }
    }

    /// The extension type the message was tagged with.
    pub fn extension_type(&self) -> u8 {
        self.raw().header.kind
    }

    fn length(&self) -> usize {
        u32::from_be(self.raw().header.length) as usize
    }

    fn protocol_name(&self) -> String {
        let bytes: Vec<u8> = self.raw().protocol_name.iter().map(|c| *c as u8).collect();
        match CStr::from_bytes_until_nul(&bytes) {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    fn version(&self) -> u32 {
        self.raw().version as u32
    }

    fn payload(&self) -> Option<Vec<u8>> {
        let json = self.raw().json;
        if json.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(json) }.to_bytes().to_vec())
    }
}

impl Drop for BinaryMessage {
    fn drop(&mut self) {
        unsafe {
            let msg = self.raw.as_ptr();
            libc::free((*msg).json as *mut c_void);
            libc::free(msg as *mut c_void);
        }
    }
}

impl fmt::Debug for BinaryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryMessage")
            .field("type", &self.extension_type())
            .field("protocol_name", &self.protocol_name())
            .field("version", &self.version())
            .field("has_payload", &!self.raw().json.is_null())
            .finish()
    }
}

/// Frames payloads for one protocol and one negotiated extension type.
#[derive(Clone, Copy, Debug)]
pub struct RelayCodec {
    protocol: ProtocolInfo,
    extension_type: u8,
}

impl RelayCodec {
    /// Creates a codec. `extension_type` is the type byte the peer assigned to the JSON extension.
    pub fn new(protocol: ProtocolInfo, extension_type: u8) -> Self {
        RelayCodec { protocol, extension_type }
    }

    /// The protocol this codec speaks
    pub fn protocol(&self) -> ProtocolInfo {
        self.protocol
    }

    /// Wraps `payload` into a new message. A `None` payload is carried as a null pointer.
    pub fn encode(&self, payload: Option<&[u8]>) -> Result<BinaryMessage, CodecError> {
        BinaryMessage::alloc(&self.protocol, self.extension_type, payload)
    }

    /// Extracts the payload of `message` after checking it was framed for this protocol.
    pub fn decode(&self, message: &BinaryMessage) -> Result<Option<Vec<u8>>, CodecError> {
        if message.length() != MESSAGE_SIZE {
            return Err(CodecError::InvalidLength {
                got: message.length(),
                expected: MESSAGE_SIZE,
            });
        }
        let name = message.protocol_name();
        if name != self.protocol.name || message.version() != self.protocol.version {
            return Err(CodecError::ProtocolMismatch {
                got_name: name,
                got_version: message.version(),
                expected_name: self.protocol.name,
                expected_version: self.protocol.version,
            });
        }
        Ok(message.payload())
    }
}
