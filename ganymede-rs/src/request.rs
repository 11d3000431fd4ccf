//! Provides a parser and wrapper for handling incoming RESP requests.
//!
//! A RESP request (that is "REdis Serialization Protocol") starts with a "*" followed by the
//! number of arguments. Each argument is a "$" followed by its length in bytes, a CRLF, the data
//! itself and yet another CRLF.
//!
//! Therefore a simple request might look like:
//! * "PING" => `*1\r\n$4\r\nPING\r\n`
//! * "CACHE.GET token" => `*2\r\n$9\r\nCACHE.GET\r\n$5\r\ntoken\r\n`
//!
//! As requests arrive via the network, a buffer might only contain a partial request.
//! [Request::parse](Request::parse) detects this without copying any data: a parsed request only
//! keeps offsets into the received buffer.
//!
//! # Examples
//!
//! Parsing a simple request:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let bytes = BytesMut::from("*2\r\n$9\r\nCACHE.GET\r\n$5\r\ntoken\r\n");
//! let request = Request::parse(&bytes).unwrap().unwrap();
//!
//! assert_eq!(request.command(), "CACHE.GET");
//! assert_eq!(request.str_parameter(0).unwrap(), "token");
//! ```
//!
//! Parsing a partial request:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let bytes = BytesMut::from("*2\r\n$9\r\nCACHE.GET\r\n$5\r\ntok");
//! assert_eq!(Request::parse(&bytes).unwrap().is_none(), true);
//! ```
//!
//! Parsing an invalid request:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let bytes = BytesMut::from("$4\r\nPING\r\n");
//! assert_eq!(Request::parse(&bytes).is_err(), true);
//! ```
use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};

/// Represents the byte range of either the command or a parameter (both bounds inclusive).
#[derive(Copy, Clone, Debug)]
struct Range {
    start: usize,
    end: usize,
}

impl Range {
    /// Computes the start of the subsequent element by skipping over the CRLF.
    fn next_offset(&self) -> usize {
        self.end + 3
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Represents a parsed RESP request.
///
/// The first element is treated as "command" and all other elements are numbered as parameters
/// starting at 0. Therefore "CACHE.CREATE key value" has "key" as parameter 0 and "value" as
/// parameter 1.
pub struct Request {
    len: usize,
    data: Bytes,
    command: Range,
    arguments: Vec<Range>,
}

impl Request {
    const DOLLAR: u8 = b'$';
    const ASTERISK: u8 = b'*';
    const CR: u8 = b'\r';

    /// Tries to parse a RESP request from the given byte buffer.
    ///
    /// Returns an **Err** for malformed data, **Ok(None)** if only a partial request is present
    /// and **Ok(Some(request))** otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bytes::BytesMut;
    /// # use ganymede::request::Request;
    /// let bytes = BytesMut::from("*3\r\n$12\r\nCACHE.CREATE\r\n$1\r\nx\r\n$1\r\ny\r\n");
    /// let request = Request::parse(&bytes).unwrap().unwrap();
    ///
    /// assert_eq!(request.command(), "CACHE.CREATE");
    /// assert_eq!(request.parameter_count(), 2);
    /// assert_eq!(request.str_parameter(1).unwrap(), "y");
    /// assert_eq!(request.str_parameter(2).is_err(), true);
    /// ```
    pub fn parse(data: &BytesMut) -> Result<Option<Request>> {
        // Abort as early as possible if the buffer cannot contain a complete request...
        if data.len() < 4 || data[data.len() - 2] != Request::CR {
            Ok(None)
        } else {
            Request::parse_inner(data)
        }
    }

    /// Builds a request from the given strings, used in tests and examples.
    ///
    /// # Example
    /// ```
    /// # use ganymede::request::Request;
    /// let request = Request::example(vec!["LIST.EVICT", "tokens", "t1", "t2"]);
    /// assert_eq!(request.command(), "LIST.EVICT");
    /// assert_eq!(request.str_parameters_from(1).unwrap(), vec!["t1", "t2"]);
    /// ```
    pub fn example(data: Vec<&str>) -> Request {
        let mut input = format!("*{}\r\n", data.len());
        for param in data {
            input.push_str(&format!("${}\r\n{}\r\n", param.len(), param));
        }

        Request::parse(&BytesMut::from(input.as_str()))
            .unwrap()
            .unwrap()
    }

    fn parse_inner(data: &BytesMut) -> Result<Option<Request>> {
        if data[0] != Request::ASTERISK {
            return Err(anyhow!("A request must be an array of bulk strings!"));
        }

        let (num_elements, range) = match Request::read_int(data, 1)? {
            Some(result) => result,
            _ => return Ok(None),
        };
        if num_elements < 1 {
            return Err(anyhow!("A request must at least contain a command!"));
        }
        let mut offset = range.next_offset();

        let command = match Request::read_bulk_string(data, offset)? {
            Some(range) => range,
            _ => return Ok(None),
        };
        if std::str::from_utf8(&data[command.start..=command.end]).is_err() {
            return Err(anyhow!("The command name must be a valid UTF-8 string!"));
        }
        offset = command.next_offset();

        let mut arguments = Vec::with_capacity(num_elements as usize - 1);
        for _ in 1..num_elements {
            match Request::read_bulk_string(data, offset)? {
                Some(range) => {
                    arguments.push(range);
                    offset = range.next_offset();
                }
                None => return Ok(None),
            }
        }

        Ok(Some(Request {
            len: offset,
            data: data.clone().freeze(),
            command,
            arguments,
        }))
    }

    /// Reads a decimal number terminated by CR.
    ///
    /// Returns **None** if the terminating CR hasn't been received yet.
    fn read_int(buffer: &BytesMut, offset: usize) -> Result<Option<(i32, Range)>> {
        let mut value: i32 = 0;
        for index in offset..buffer.len() {
            let digit = buffer[index];
            if digit == Request::CR {
                if index == offset {
                    return Err(anyhow!("Empty integer at position {}", index));
                }
                return Ok(Some((
                    value,
                    Range {
                        start: offset,
                        end: index - 1,
                    },
                )));
            }
            if !digit.is_ascii_digit() {
                return Err(anyhow!("Malformed integer at position {}", index));
            }

            value = value
                .checked_mul(10)
                .and_then(|value| value.checked_add((digit - b'0') as i32))
                .ok_or_else(|| anyhow!("Integer overflow at position {}", index))?;
        }

        Ok(None)
    }

    fn read_bulk_string(buffer: &BytesMut, offset: usize) -> Result<Option<Range>> {
        if offset >= buffer.len() {
            return Ok(None);
        }
        if buffer[offset] != Request::DOLLAR {
            return Err(anyhow!("Expected a bulk string at {}", offset));
        }

        if let Some((length, range)) = Request::read_int(buffer, offset + 1)? {
            let start = range.next_offset();
            if buffer.len() >= start + length as usize + 2 {
                // An empty string yields end = start - 1 which is a valid empty inclusive range.
                return Ok(Some(Range {
                    start,
                    end: start + length as usize - 1,
                }));
            }
        }

        Ok(None)
    }

    /// Returns the command in the request (this is the first element).
    pub fn command(&self) -> &str {
        // Validated during parsing...
        std::str::from_utf8(&self.data[self.command.start..=self.command.end]).unwrap_or_default()
    }

    /// Returns the number of parameters (not counting the command itself).
    pub fn parameter_count(&self) -> usize {
        self.arguments.len()
    }

    fn range(&self, index: usize) -> Result<Range> {
        self.arguments.get(index).copied().ok_or_else(|| {
            anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.arguments.len()
            )
        })
    }

    /// Returns the n-th parameter (not including the command).
    pub fn parameter(&self, index: usize) -> Result<Bytes> {
        let range = self.range(index)?;
        Ok(self.data.slice(range.start..=range.end))
    }

    /// Returns the n-th parameter as UTF-8 string.
    pub fn str_parameter(&self, index: usize) -> Result<&str> {
        let range = self.range(index)?;
        std::str::from_utf8(&self.data[range.start..=range.end]).with_context(|| {
            format!(
                "Failed to parse parameter {} (range {}) as UTF-8 string!",
                index, range
            )
        })
    }

    /// Returns all parameters starting at the given index as UTF-8 strings.
    ///
    /// Fails if not at least one parameter is present at the given index.
    pub fn str_parameters_from(&self, index: usize) -> Result<Vec<&str>> {
        if index >= self.arguments.len() {
            return Err(anyhow!(
                "Expected at least {} parameters but only {} are present",
                index + 1,
                self.arguments.len()
            ));
        }

        (index..self.arguments.len())
            .map(|index| self.str_parameter(index))
            .collect()
    }

    /// Ensures that exactly the given number of parameters is present.
    pub fn expect_parameters(&self, count: usize) -> Result<()> {
        if self.arguments.len() != count {
            Err(anyhow!(
                "{} expects {} parameter(s) but {} were given",
                self.command(),
                count,
                self.arguments.len()
            ))
        } else {
            Ok(())
        }
    }

    /// Returns the total length in bytes of this request.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determines if the request has no parameters.
    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }
}
