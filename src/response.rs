//! Per-exchange response state.
//!
//! Grounded on hyper's `proto::mod::MessageHead` and its internal
//! `http::message::ResponseHead`, plus the `committedMetaData` snapshot the
//! data model calls for: once a response
//! is committed, the status/reason/fields that actually went out over the
//! wire are frozen, separate from whatever a handler mutates afterward
//! (Jetty-style "committed metadata" semantics hyper's own client-oriented
//! response type has no need for).

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::error::Error;
use crate::io::output::HttpOutput;
use crate::transport::{ResponseInfo, Transport};

/// A frozen snapshot of what was actually sent as the status line and
/// headers, captured at commit time — the same shape `Transport::send`
/// receives its `info` in.
pub type CommittedMetaData = ResponseInfo;

/// The response half of one HTTP exchange.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    fields: HeaderMap,
    content_length: Option<u64>,
    committed_meta_data: Option<CommittedMetaData>,
    output: HttpOutput,
}

impl Response {
    /// A fresh `200 OK` response with no fields set.
    pub fn new(output: HttpOutput) -> Response {
        Response {
            status: StatusCode::OK,
            reason: None,
            version: Version::HTTP_11,
            fields: HeaderMap::new(),
            content_length: None,
            committed_meta_data: None,
            output,
        }
    }

    /// The status that will be (or was) sent.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Set the status to send. A no-op error if the response is already
    /// committed.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), Error> {
        if self.is_committed() {
            return Err(Error::already_committed());
        }
        self.status = status;
        Ok(())
    }

    /// The reason phrase that will be (or was) sent, if overridden.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Override the reason phrase.
    pub fn set_reason<S: Into<String>>(&mut self, reason: S) -> Result<(), Error> {
        if self.is_committed() {
            return Err(Error::already_committed());
        }
        self.reason = Some(reason.into());
        Ok(())
    }

    /// The declared HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response header fields.
    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    /// Mutable access to the response header fields. A no-op error if the
    /// response is already committed.
    pub fn fields_mut(&mut self) -> Result<&mut HeaderMap, Error> {
        if self.is_committed() {
            return Err(Error::already_committed());
        }
        Ok(&mut self.fields)
    }

    /// The declared `Content-Length`, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Set the declared `Content-Length`.
    pub fn set_content_length(&mut self, len: u64) -> Result<(), Error> {
        if self.is_committed() {
            return Err(Error::already_committed());
        }
        self.content_length = Some(len);
        Ok(())
    }

    /// Read-only access to the response body stream.
    pub fn output(&self) -> &HttpOutput {
        &self.output
    }

    /// Whether the status line/headers have gone out.
    pub fn is_committed(&self) -> bool {
        self.output.is_committed()
    }

    /// A snapshot of what was actually sent, once committed.
    pub fn committed_meta_data(&self) -> Option<&CommittedMetaData> {
        self.committed_meta_data.as_ref()
    }

    /// Freeze the current status/reason/fields as the committed metadata,
    /// mark the output stream committed, and send the response head to
    /// `transport` — the one `Transport::send` call per commit that
    /// carries `Some(info)` rather than `None`. `informational`
    /// distinguishes a 1xx response, which commits-then-uncommits so the
    /// eventual final response can still commit (and so sends its own head
    /// in turn).
    pub fn commit(&mut self, informational: bool, transport: &mut dyn Transport) -> Result<(), Error> {
        self.output.commit()?;
        let info = ResponseInfo {
            status: self.status,
            reason: self
                .reason
                .clone()
                .unwrap_or_else(|| self.status.canonical_reason().unwrap_or("").to_owned()),
            version: self.version,
            fields: self.fields.clone(),
        };
        transport.send(Some(info.clone()), Bytes::new(), false)?;
        self.committed_meta_data = Some(info);
        if informational {
            self.output.uncommit();
        }
        Ok(())
    }

    /// Reset to a fresh `200 OK` with no fields, for reuse on the next
    /// exchange.
    pub fn recycle(&mut self) {
        self.status = StatusCode::OK;
        self.reason = None;
        self.version = Version::HTTP_11;
        self.fields.clear();
        self.content_length = None;
        self.committed_meta_data = None;
        self.output.recycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::output::OutputConfig;
    use crate::transport::mock::MockTransport;

    fn response() -> Response {
        Response::new(HttpOutput::new(OutputConfig::default()))
    }

    #[test]
    fn fresh_response_defaults_to_200() {
        let resp = response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.is_committed());
    }

    #[test]
    fn mutating_after_commit_is_rejected() {
        let mut resp = response();
        let mut transport = MockTransport::new();
        resp.commit(false, &mut transport).unwrap();
        assert!(resp.set_status(StatusCode::NOT_FOUND).is_err());
        assert!(resp.fields_mut().is_err());
    }

    #[test]
    fn commit_snapshots_committed_meta_data() {
        let mut resp = response();
        let mut transport = MockTransport::new();
        resp.set_status(StatusCode::CREATED).unwrap();
        resp.commit(false, &mut transport).unwrap();
        let meta = resp.committed_meta_data().unwrap();
        assert_eq!(meta.status, StatusCode::CREATED);
    }

    #[test]
    fn commit_sends_the_response_head_to_the_transport() {
        let mut resp = response();
        let mut transport = MockTransport::new();
        resp.set_status(StatusCode::CREATED).unwrap();
        resp.commit(false, &mut transport).unwrap();
        let head = transport.head().unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
    }

    #[test]
    fn informational_commit_allows_a_later_final_commit() {
        let mut resp = response();
        let mut transport = MockTransport::new();
        resp.set_status(StatusCode::CONTINUE).unwrap();
        resp.commit(true, &mut transport).unwrap();
        assert!(!resp.is_committed());
        resp.set_status(StatusCode::OK).unwrap();
        resp.commit(false, &mut transport).unwrap();
        assert!(resp.is_committed());
        assert_eq!(transport.head().unwrap().status, StatusCode::OK);
    }

    #[test]
    fn recycle_clears_status_and_commit_state() {
        let mut resp = response();
        let mut transport = MockTransport::new();
        resp.set_status(StatusCode::NOT_FOUND).unwrap();
        resp.commit(false, &mut transport).unwrap();
        resp.recycle();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.is_committed());
    }
}
