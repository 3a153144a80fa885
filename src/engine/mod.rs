pub mod lifecycle;
pub mod matching;
pub mod retry;
