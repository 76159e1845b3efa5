//! Property-based tests spanning the filter engine and the event store.

mod store_properties;
