/// "Internals" refers to low-level objects that are used to implement the "Resources" objects.
/// They should not be used directly by the user.

pub mod descriptor_allocator;
pub mod descriptor_heap;
