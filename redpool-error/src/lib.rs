// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(clippy::all)]
//! Errors of the redpool connection pool.
//!
//! Every fallible pool operation returns a boxed [Error]. Its [ErrorType] says which step of the
//! connection lifecycle failed (dialing, closing, using a closed pool, loading configuration),
//! and its [ErrorSource] says whether the server or the local pool is to blame.

pub use std::error::Error as ErrorTrait;
use std::borrow::Cow;
use std::fmt;

/// The boxed [Error], the desired way to pass [Error]
pub type BError = Box<Error>;
/// Syntax sugar for `std::Result<T, BError>`
pub type Result<T, E = BError> = std::result::Result<T, E>;

type Cause = Box<dyn ErrorTrait + Send + Sync>;

/// The step of the connection lifecycle that failed
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorType {
    /// The server did not accept the connection in time
    ConnectTimedout,
    /// The server actively refused the connection
    ConnectRefused,
    /// Any other failure to establish a connection
    ConnectError,
    /// A connection could not be closed. The pool releases its slot regardless.
    CloseError,
    /// The pool was closed before or while waiting for a connection
    PoolClosed,
    /// The pool configuration is malformed or out of range
    InvalidConf,
    /// The configuration file could not be read
    FileReadError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ConnectTimedout => "ConnectTimedout",
            ErrorType::ConnectRefused => "ConnectRefused",
            ErrorType::ConnectError => "ConnectError",
            ErrorType::CloseError => "CloseError",
            ErrorType::PoolClosed => "PoolClosed",
            ErrorType::InvalidConf => "InvalidConf",
            ErrorType::FileReadError => "FileReadError",
        }
    }

    /// Whether a dial hook failed. Pool state is left untouched by these.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            ErrorType::ConnectTimedout | ErrorType::ConnectRefused | ErrorType::ConnectError
        )
    }
}

/// Who is to blame for an [Error]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorSource {
    /// The server, or the transport to it
    Server,
    /// The pool itself, or how the caller uses it
    Local,
    /// Not classified by whoever raised the error
    Unset,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Server => "Server",
            ErrorSource::Local => "Local",
            ErrorSource::Unset => "",
        }
    }
}

/// The error returned by pool operations
#[derive(Debug)]
pub struct Error {
    pub etype: ErrorType,
    pub esource: ErrorSource,
    /// The lower level error, usually an `io::Error` from the transport
    pub cause: Option<Cause>,
    /// What the pool was doing, e.g. the address being dialed
    pub context: Option<Cow<'static, str>>,
}

impl Error {
    fn create(etype: ErrorType, context: Option<Cow<'static, str>>, cause: Option<Cause>) -> BError {
        Box::new(Error {
            etype,
            esource: ErrorSource::Unset,
            cause,
            context,
        })
    }

    /// Create an error of type `e` with `context`, caused by `cause`.
    /// ```
    /// use redpool_error::{Error, ErrorType, Result};
    ///
    /// fn shutdown() -> std::io::Result<()> {
    ///     // ...
    ///     Ok(())
    /// }
    /// fn close_connection() -> Result<()> {
    ///     shutdown().map_err(|e| Error::because(ErrorType::CloseError, "shutdown failed", e))
    /// }
    /// ```
    pub fn because<C: Into<Cow<'static, str>>, E: Into<Cause>>(
        e: ErrorType,
        context: C,
        cause: E,
    ) -> BError {
        Self::create(e, Some(context.into()), Some(cause.into()))
    }

    /// Create an error of type `e` with `context` and no lower level cause
    pub fn explain<C: Into<Cow<'static, str>>>(e: ErrorType, context: C) -> BError {
        Self::create(e, Some(context.into()), None)
    }

    /// Short for `Err(Error::explain(e, context))`
    pub fn e_explain<T, C: Into<Cow<'static, str>>>(e: ErrorType, context: C) -> Result<T> {
        Err(Self::explain(e, context))
    }

    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    pub fn esource(&self) -> &ErrorSource {
        &self.esource
    }

    /// Blame the server
    pub fn into_server(mut self: BError) -> BError {
        self.esource = ErrorSource::Server;
        self
    }

    /// Blame the local pool
    pub fn into_local(mut self: BError) -> BError {
        self.esource = ErrorSource::Local;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.esource != ErrorSource::Unset {
            write!(f, "{} ", self.esource.as_str())?;
        }
        f.write_str(self.etype.as_str())?;
        if let Some(context) = &self.context {
            write!(f, " context: {context}")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " cause: {cause}")?;
        }
        Ok(())
    }
}

impl ErrorTrait for Error {
    fn source(&self) -> Option<&(dyn ErrorTrait + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn ErrorTrait + 'static))
    }
}

/// Wrap a foreign error, e.g. an `io::Error` from the transport, into an [Error]
pub trait OrErr<T, E> {
    /// Turn `Err(E)` into an [Error] of type `et` with a static `context`. E becomes the cause.
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T>;

    /// Like [OrErr::or_err()], but builds the context lazily, e.g. to format a peer address.
    fn or_err_with<C: Into<Cow<'static, str>>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T>;
}

impl<T, E: Into<Cause>> OrErr<T, E> for std::result::Result<T, E> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T> {
        self.map_err(|e| Error::because(et, context, e))
    }

    fn or_err_with<C: Into<Cow<'static, str>>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T> {
        self.map_err(|e| Error::because(et, context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_close_failure_display() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone");
        let err = Err::<(), _>(io_err)
            .or_err(ErrorType::CloseError, "closing connection")
            .unwrap_err();
        assert_eq!(err.esource(), &ErrorSource::Unset);
        assert_eq!(
            err.to_string(),
            "CloseError context: closing connection cause: pipe gone"
        );
        // the io error stays reachable for callers matching on its kind
        let cause = err.source().unwrap().downcast_ref::<io::Error>().unwrap();
        assert_eq!(cause.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_dial_failure_display() {
        let addr = "127.0.0.1:6379";
        let err = Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
            .or_err_with(ErrorType::ConnectRefused, || format!("Fail to connect to {addr}"))
            .unwrap_err()
            .into_server();
        assert!(err.etype().is_connect_error());
        assert!(err
            .to_string()
            .starts_with("Server ConnectRefused context: Fail to connect to 127.0.0.1:6379"));
    }

    #[test]
    fn test_pool_closed() {
        let err: Result<()> = Error::e_explain(ErrorType::PoolClosed, "get() from a closed pool");
        let err = err.unwrap_err().into_local();
        assert_eq!(err.esource(), &ErrorSource::Local);
        assert!(!err.etype().is_connect_error());
        assert_eq!(err.to_string(), "Local PoolClosed context: get() from a closed pool");
        assert!(err.source().is_none());
    }
}
