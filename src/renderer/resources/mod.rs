/// "Resources" refers to middle-level objects built on top of the device and the descriptor heaps.
/// They are relatively intuitive and managed by the user.

pub mod buffer;
pub mod constant_buffer;
pub mod desc;
pub mod memory_heap;
pub mod resource;
pub mod texture;
pub mod upload;
pub mod vertex;
