//! Everstream
//!
//! Durable, resumable event streams over HTTP: an append-only log server
//! with long-poll and SSE fan-out, an idempotent producer protocol, and a
//! typed RPC routing layer that multiplexes collections onto streams.
//!
//! # Server quick start
//!
//! ```rust,no_run
//! use everstream::{start_server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     start_server(ServerOptions {
//!         port: 4437,
//!         ..Default::default()
//!     })
//!     .await
//! }
//! ```
//!
//! # Client quick start
//!
//! ```rust,no_run
//! use everstream::{Client, LiveMode, Offset};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!     let stream = client.stream("http://localhost:4437/streams/my-stream");
//!
//!     stream.create().await?;
//!     stream.append("hello world").await?;
//!
//!     let mut reader = stream.read().offset(Offset::Beginning).build();
//!     while let Some(chunk) = reader.next_chunk().await? {
//!         println!("Got {} bytes", chunk.data.len());
//!         if chunk.up_to_date {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Protocol sketch
//!
//! ```text
//! PUT /streams/events          create (idempotent; 409 on config mismatch)
//! POST /streams/events         append -> Stream-Offset
//! POST + Stream-Closed: true   close (trailing body allowed)
//! GET /streams/events?offset=-1                 catch-up read
//! GET ...&live=long-poll                        block until data/timeout
//! GET ...&live=sse                              event/data + control frames
//! DELETE /streams/events       delete; waiters observe closure
//! ```

pub mod client;
pub mod codec;
pub mod collection;
pub mod cursor;
pub mod error;
pub mod fault;
pub mod headers;
pub mod iterator;
pub mod producer;
pub mod producers;
pub mod retry;
pub mod router;
pub mod rpc;
pub mod server;
pub mod sse;
pub mod store;
pub mod stream;
pub mod types;

pub use client::{Client, ClientBuilder};
pub use collection::{
    ChangeEvent, ChangeHeaders, CollectionSet, EventBuilder, FieldKind, Operation, ValueSchema,
};
pub use error::{
    ProcedureError, ProducerError, RouterBuildError, RpcError, StoreError, StreamError,
};
pub use fault::FaultDirective;
pub use iterator::{Batch, Chunk, ChunkIterator, ReadBuilder, RetryDirective};
pub use producer::{AppendReceipt, Producer, ProducerBuilder};
pub use retry::RetryConfig;
pub use router::{
    CollectionDef, PathTemplate, ProcedureDef, ProcedureRequest, RouteDef, RouterDef, RpcRouter,
    StreamDef,
};
pub use rpc::{CollectionHandle, CollectionSubscription, RpcClient};
pub use server::{create_router, start_server, serve, AppState, ServerContext};
pub use store::{AppendOutcome, StreamStore};
pub use stream::{
    AppendOptions, AppendResponse, CloseResponse, CreateOptions, HeadResponse, StreamHandle,
};
pub use types::{
    LiveMode, Offset, ReadResult, ServerOptions, StreamConfig, StreamMessage, WaitOutcome,
};
