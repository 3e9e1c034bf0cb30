pub mod machine;
pub mod register_allocator;
pub mod targets;
