mod http;
mod kv;
mod push;

pub use self::http::{
    is_retryable_status, FeedService, HttpError, ValidatedUrl, DECIDE_PATH, DELETE_MESSAGE_PATH,
    DELTA_FEED_PATH, DISPATCH_NOTIFICATION_PATH, MARK_READ_PATH,
};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, KvResult, MemoryKvStore, StorageErrorCode,
    MAX_KEY_LENGTH, MAX_VALUE_SIZE,
};
pub use self::push::{NotificationTrigger, PushDispatcher, PushError, ScheduledNotification};

#[cfg(feature = "http")]
pub use self::http::HttpFeedService;

pub(crate) use self::kv::check_value_size;
