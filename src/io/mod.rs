//! Buffered request/response body pipelines.
//!
//! `input` and `output` implement the two halves of an exchange's body
//! traffic: a pull-style, interceptable read side and a push-style,
//! aggregating write side. Both are grounded on hyper's `proto::h1::io`
//! buffering (`Buffered<T, B>`), adapted from a single full-duplex byte
//! stream into the two independently-stated pipelines the channel design
//! calls for.

pub mod input;
pub mod interceptor;
pub mod output;
