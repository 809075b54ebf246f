mod collect;

pub use collect::CollectArgs;
