pub mod bloom_filter;
pub mod connection;
pub mod connectivity_monitor;
pub mod credentials;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterError};
pub use connection::{
    Connection, ConnectionArc, JsonStreamHandle, MultiplexedStreamingConnection, StreamHandle,
    StreamHandleArc, StreamKind,
};
pub use connectivity_monitor::{
    ConnectivityCallback, ConnectivityMonitor, ConnectivityMonitorArc, ManualConnectivityMonitor,
    NetworkStatus, NoopConnectivityMonitor,
};
pub use credentials::{
    CredentialChangeListener, EmptyCredentialsProvider, StaticCredentialsProvider, Token,
    TokenProvider, TokenProviderArc, User,
};
pub use online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use serializer::JsonProtoSerializer;
pub use stream::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, PersistentStream,
    PersistentStreamListener, StreamState, StreamTransport,
};
pub use streams::{WatchStream, WatchStreamListener, WriteStream, WriteStreamListener};
pub use watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{
    BloomFilterApplication, TargetMetadataProvider, WatchChangeAggregator,
};
