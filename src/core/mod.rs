pub mod adaptive;
pub mod dag;
pub mod dataset;
pub mod lineage;
pub mod operator;
pub mod partition;
pub mod stage;
pub mod task;

pub use adaptive::*;
pub use dag::*;
pub use dataset::*;
pub use lineage::*;
pub use operator::*;
pub use partition::*;
pub use stage::*;
pub use task::*;
