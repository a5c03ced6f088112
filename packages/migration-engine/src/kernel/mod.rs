// Kernel - shared infrastructure for running migrations

mod migration_kernel;
pub mod schema;

pub use migration_kernel::MigrationKernel;
