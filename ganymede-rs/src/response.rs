//! Represents a memory backed RESP response.
//!
//! The whole response is built in an internal buffer and then pushed onto the wire with a single
//! sys-call. Cache entries are expected to be small, therefore we pre-allocate 8 kB and only
//! grow the buffer if needed.
//!
//! The response also tracks the nesting of arrays so that a handler cannot emit a structurally
//! invalid response (e.g. an array with a missing element).
//!
//! # Example
//!
//! ```
//! # use ganymede::response::{OutputError, Response};
//! # fn main() -> Result<(), OutputError> {
//! let mut response = Response::new();
//! response.array(3)?;
//! response.bulk("token")?;
//! response.bulk("{\"user\":\"alice\"}")?;
//! response.bulk("2024-01-01T00:00:00Z")?;
//!
//! assert_eq!(
//!     response.complete_string()?,
//!     "*3\r\n$5\r\ntoken\r\n$16\r\n{\"user\":\"alice\"}\r\n$20\r\n2024-01-01T00:00:00Z\r\n"
//! );
//! # Ok(())
//! # }
//! ```
use std::fmt::Write;

use anyhow::anyhow;
use bytes::BytesMut;

/// Enumerates the possible errors when creating a response.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// Represents any IO or formatting error while generating the response.
    #[error("IO error: {0:?}")]
    IOError(#[from] std::fmt::Error),

    /// Represents a protocol error which most probably indicates an invalid nesting
    /// (e.g. when providing too few or too many result entries for an array..).
    #[error("Protocol error: {0:#}")]
    ProtocolError(anyhow::Error),
}

impl From<anyhow::Error> for OutputError {
    fn from(err: anyhow::Error) -> OutputError {
        OutputError::ProtocolError(err)
    }
}

/// Represents the result type for all output operations.
pub type OutputResult = Result<(), OutputError>;

/// Represents a RESP response being built.
#[derive(Default)]
pub struct Response {
    buffer: BytesMut,
    nesting: Vec<i32>,
}

/// Represents a separator used when outputting management data.
pub static SEPARATOR: &str =
    "-------------------------------------------------------------------------------\n";

const BLOCK_SIZE: usize = 8192;

impl Response {
    /// Creates a new response which expects exactly one top-level element.
    pub fn new() -> Self {
        Response {
            buffer: BytesMut::with_capacity(BLOCK_SIZE),
            nesting: vec![1],
        }
    }

    fn check_nesting(&mut self) -> OutputResult {
        let current_nesting = self
            .nesting
            .last_mut()
            .ok_or_else(|| OutputError::ProtocolError(anyhow!("Invalid result nesting!")))?;

        *current_nesting -= 1;
        if *current_nesting == 0 {
            let _ = self.nesting.pop();
        }

        Ok(())
    }

    #[inline]
    fn reserve(&mut self, required_length: usize) {
        if self.buffer.capacity() - self.buffer.len() < required_length {
            let required_blocks = (required_length / BLOCK_SIZE) + 1;
            self.buffer.reserve(required_blocks * BLOCK_SIZE);
        }
    }

    /// Completes the response and returns the serialized bytes.
    ///
    /// Fails if the nesting is invalid (e.g. an array is missing elements).
    pub fn complete(self) -> Result<BytesMut, OutputError> {
        if !self.nesting.is_empty() {
            return Err(OutputError::ProtocolError(anyhow!(
                "Invalid result nesting!"
            )));
        }

        Ok(self.buffer)
    }

    /// Completes the response and returns it as string.
    ///
    /// This is only intended to be used in tests.
    pub fn complete_string(self) -> Result<String, OutputError> {
        let buffer = self.complete()?;
        String::from_utf8(buffer.to_vec())
            .map_err(|_| OutputError::ProtocolError(anyhow!("Non UTF-8 data found")))
    }

    /// Starts an array with the given number of items.
    ///
    /// This call has to be followed by the exact number of elements.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.array(2)?;
    /// response.array(0)?;
    /// response.simple("done")?;
    ///
    /// assert_eq!(response.complete_string()?, "*2\r\n*0\r\n+done\r\n");
    /// #    Ok(())
    /// # }
    /// ```
    ///
    /// Missing elements are detected:
    /// ```should_panic
    /// # use ganymede::response::Response;
    /// let mut response = Response::new();
    /// response.array(3).unwrap();
    /// response.simple("Hello").unwrap();
    ///
    /// response.complete_string().unwrap();
    /// ```
    pub fn array(&mut self, items: usize) -> OutputResult {
        self.check_nesting()?;
        if items > 0 {
            self.nesting.push(
                i32::try_from(items).map_err(|_| anyhow!("Too many array items: {}", items))?,
            );
        }
        self.reserve(16);
        write!(self.buffer, "*{}\r\n", items)?;
        Ok(())
    }

    /// Emits "OK" as simple string.
    pub fn ok(&mut self) -> OutputResult {
        self.simple("OK")
    }

    /// Emits the given string as **simple string**.
    ///
    /// A simple string must not contain line breaks (CR or LF). This isn't enforced here. When in
    /// doubt, use [Response::bulk](Response::bulk).
    pub fn simple(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.check_nesting()?;
        self.reserve(3 + string.as_ref().len());
        self.buffer.write_char('+')?;
        self.buffer.write_str(string.as_ref())?;
        self.buffer.write_str("\r\n")?;

        Ok(())
    }

    /// Emits the given string as bulk data.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.bulk("Hello\nWorld")?;
    /// assert_eq!(response.complete_string()?, "$11\r\nHello\nWorld\r\n");
    /// #    Ok(())
    /// # }
    /// ```
    pub fn bulk(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.check_nesting()?;
        self.reserve(3 + 16 + string.as_ref().len());
        write!(self.buffer, "${}\r\n", string.as_ref().len())?;
        self.buffer.write_str(string.as_ref())?;
        self.buffer.write_str("\r\n")?;

        Ok(())
    }

    /// Emits a null bulk string which clients report as "no value".
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.null()?;
    /// assert_eq!(response.complete_string()?, "$-1\r\n");
    /// #    Ok(())
    /// # }
    /// ```
    pub fn null(&mut self) -> OutputResult {
        self.check_nesting()?;
        self.reserve(5);
        self.buffer.write_str("$-1\r\n")?;

        Ok(())
    }

    /// Emits an error message.
    ///
    /// Errors are encoded as "-ERROR MESSAGE". CR and LF are replaced by spaces so that we do not
    /// double fail when reporting an error.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.error("CLIENT: Good bye,\ncruel World")?;
    /// assert_eq!(response.complete_string()?, "-CLIENT: Good bye, cruel World\r\n");
    /// #    Ok(())
    /// # }
    /// ```
    pub fn error(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.check_nesting()?;
        self.reserve(3 + string.as_ref().len());
        self.buffer.write_char('-')?;
        self.buffer
            .write_str(&string.as_ref().replace(['\r', '\n'], " "))?;
        self.buffer.write_str("\r\n")?;

        Ok(())
    }

    /// Emits an error whose first word is a machine readable code.
    ///
    /// Redis clients expose the first word of an error reply as its "code", therefore consumers
    /// can branch on it without parsing the message.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.coded_error("NOT_FOUND", "No entry for 'token'")?;
    /// assert_eq!(response.complete_string()?, "-NOT_FOUND No entry for 'token'\r\n");
    /// #    Ok(())
    /// # }
    /// ```
    pub fn coded_error(&mut self, code: &str, message: impl AsRef<str>) -> OutputResult {
        self.error(format!("{} {}", code, message.as_ref()))
    }
}
