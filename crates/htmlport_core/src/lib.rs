pub mod config;
pub mod confluence;
pub mod filesystem;
pub mod frontmatter;
pub mod import;
pub mod markup;
pub mod normalize;
pub mod pagemap;
pub mod reconcile;
pub mod retry;
pub mod rewrite;
pub mod simulate;
pub mod state;
pub mod transfer_log;
