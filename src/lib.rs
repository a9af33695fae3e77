pub mod core;
pub mod xml;
pub mod storage;
pub mod resource;
pub mod query;
pub mod http;

pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::http::{QueryService, Request, RequestDispatcher, Response};

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                              XMLGATE REQUEST ARCHITECTURE                                    │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────────── HTTP LAYER ─────────────────────────────────────────┐
│                                                                                              │
│  QueryService::handle(Request).await ──spawn_blocking──▶ RequestDispatcher::dispatch         │
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                          struct RequestDispatcher                                   │    │
│  │ config: Config                          // encodings, flags, timeouts              │    │
│  │ store: Arc<dyn Store>                   // document tree                           │    │
│  │ resolver: ResourceResolver              // path → locked resource                  │    │
│  │ engine: Arc<dyn QueryEngine>            // compile + execute                       │    │
│  │ policy: Arc<dyn AccessPolicy>           // read / write decisions                  │    │
│  │ pool: Arc<QueryPool>                    // idle compiled queries                   │    │
│  │ sessions: Arc<ResultSessionCache>       // cached results by session id            │    │
│  │ transactions: TransactionManager        // begin / commit / abort / close          │    │
│  │ update_processor: Option<Arc<dyn UpdateProcessor>>                                 │    │
│  │ request_adapter: Option<Arc<dyn RequestAdapter>>                                   │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  GET/POST query:  resolve ─▶ pool.borrow ─▶ bind context ─▶ execute ─▶ release lock          │
│                   ─▶ sessions.add (cache=yes) ─▶ paginate + serialize ─▶ pool.return         │
│  PUT/DELETE/XUpdate: write locks (parent before child) ─▶ transactions.run ─▶ invalidate    │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── QUERY LAYER ──────────────────────────────────────────┐
│  ┌─────────────────────────┐  ┌─────────────────────────┐  ┌───────────────────────────┐   │
│  │ struct QueryPool        │  │ struct ResultSession-   │  │ struct QueryContext       │   │
│  │ • LruCache<Fingerprint, │  │   Cache                 │  │ • static documents        │   │
│  │   Vec<CompiledQuery>>   │  │ • slots: Vec<Arc<Mutex  │  │ • namespaces, variables   │   │
│  │ • hit / miss counters   │  │   <Slot>>>              │  │ • http: HttpContext       │   │
│  └─────────────────────────┘  │ • id = generation|index │  │ • watchdog: Watchdog      │   │
│                               └─────────────────────────┘  └───────────────────────────┘   │
│                                 SessionSweeper thread: crossbeam tick ─▶ sweep(now)          │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── STORAGE LAYER ──────────────────────────────────────────┐
│  ┌─────────────────────────┐  ┌─────────────────────────┐  ┌───────────────────────────┐   │
│  │ struct LockManager      │  │ trait Store             │  │ enum DatabaseResource     │   │
│  │ • per-path RwLock       │  │ • staged mutations      │  │ • Collection              │   │
│  │ • timed acquisition     │  │ • all-or-nothing commit │  │ • XmlDocument             │   │
│  │ • ResourceLock (RAII)   │  │ • InMemoryStore         │  │ • BinaryDocument          │   │
│  └─────────────────────────┘  └─────────────────────────┘  └───────────────────────────┘   │
└──────────────────────────────────────────────────────────────────────────────────────────────┘
*/
