pub mod group;
pub mod task;

pub use group::Entity as Group;
pub use task::Entity as Task;
