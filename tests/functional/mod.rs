mod cluster;
mod hierarchy;
mod resources;
mod syncer;

pub use cluster::TestCluster;
pub use resources::TestResources;
