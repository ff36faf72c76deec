use super::{Conversation, ConversationError, ConversationErrorKind, PromptStyle};
use crate::relay::BinaryMessage;
use libc::{c_char, c_int, c_void};
use std::{
    ffi::{CStr, CString},
    fmt, ptr,
};

const PAM_SUCCESS: c_int = 0;
const PAM_ABORT: c_int = 26;

const PAM_PROMPT_ECHO_OFF: c_int = 1;
const PAM_PROMPT_ECHO_ON: c_int = 2;
const PAM_ERROR_MSG: c_int = 3;
const PAM_TEXT_INFO: c_int = 4;
const PAM_BINARY_PROMPT: c_int = 7;

#[repr(C)]
struct RawPamMessage {
    msg_style: c_int,
    msg: *const c_char,
}

#[repr(C)]
struct RawPamResponse {
    resp: *mut c_char,
    resp_retcode: c_int,
}

type ConvFn = unsafe extern "C" fn(
    num_msg: c_int,
    msg: *mut *const RawPamMessage,
    resp: *mut *mut RawPamResponse,
    appdata_ptr: *mut c_void,
) -> c_int;

/// The `struct pam_conv` an application registers with `pam_start`.
#[repr(C)]
pub struct RawPamConv {
    conv: Option<ConvFn>,
    appdata_ptr: *mut c_void,
}

/// A [`Conversation`] backed by the application's `pam_conv` callback.
pub struct PamConversation {
    conv: ConvFn,
    appdata_ptr: *mut c_void,
}

// The application owns the callback for the whole PAM transaction; calls are serialized by the
// conversation channel.
unsafe impl Send for PamConversation {}
unsafe impl Sync for PamConversation {}

impl PamConversation {
    /// Wraps the conversation item obtained with `pam_get_item(PAM_CONV)`.
    ///
    /// Returns `None` when the pointer or its callback is null.
    ///
    /// # Safety
    ///
    /// `raw` must be null or point to a valid `struct pam_conv` that outlives the returned value.
    pub unsafe fn from_raw(raw: *const RawPamConv) -> Option<Self> {
        let raw = unsafe { raw.as_ref()? };
        Some(PamConversation {
            conv: raw.conv?,
            appdata_ptr: raw.appdata_ptr,
        })
    }

    /// Sends one message and returns the `resp` pointer of the reply, which the caller must free.
    fn send(&self, style: c_int, msg: *const c_char) -> Result<*mut c_char, ConversationError> {
        let message = RawPamMessage { msg_style: style, msg };
        let mut messages: *const RawPamMessage = &message;
        let mut response: *mut RawPamResponse = ptr::null_mut();

        let code = unsafe { (self.conv)(1, &mut messages, &mut response, self.appdata_ptr) };

        let resp = match unsafe { response.as_mut() } {
            Some(r) => {
                let resp = r.resp;
                unsafe { libc::free(response as *mut c_void) };
                resp
            }
            None => ptr::null_mut(),
        };

        match code {
            PAM_SUCCESS => Ok(resp),
            other => {
                unsafe { libc::free(resp as *mut c_void) };
                if other == PAM_ABORT {
                    Err(ConversationErrorKind::Aborted.into())
                } else {
                    Err(ConversationErrorKind::Failed(other).into())
                }
            }
        }
    }
}

impl Conversation for PamConversation {
    fn prompt(&self, style: PromptStyle, text: &str) -> Result<String, ConversationError> {
        let style = match style {
            PromptStyle::EchoOff => PAM_PROMPT_ECHO_OFF,
            PromptStyle::EchoOn => PAM_PROMPT_ECHO_ON,
            PromptStyle::ErrorMsg => PAM_ERROR_MSG,
            PromptStyle::TextInfo => PAM_TEXT_INFO,
        };
        let text = CString::new(text).map_err(|e| ConversationError::new(ConversationErrorKind::InvalidText, e))?;
        let resp = self.send(style, text.as_ptr())?;
        if resp.is_null() {
            return Ok(String::new());
        }

        let reply = unsafe { CStr::from_ptr(resp) };
        let len = reply.to_bytes().len();
        let answer = reply.to_str().map(str::to_owned);
        // Replies may hold secrets.
        unsafe {
            ptr::write_bytes(resp, 0, len);
            libc::free(resp as *mut c_void);
        }
        answer.map_err(|e| ConversationError::new(ConversationErrorKind::InvalidText, e))
    }

    fn binary_prompt(&self, message: &BinaryMessage) -> Result<BinaryMessage, ConversationError> {
        let resp = self.send(PAM_BINARY_PROMPT, message.as_ptr() as *const c_char)?;
        unsafe { BinaryMessage::from_raw(resp as *mut c_void) }.ok_or_else(|| ConversationErrorKind::NoResponse.into())
    }
}

impl fmt::Debug for PamConversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PamConversation").finish_non_exhaustive()
    }
}
