use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Interleaved vertex layout shared by every mesh in the scene buffers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

impl Vertex {
    pub const STRIDE: u32 = size_of::<Vertex>() as u32;

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self { position, normal, uv }
    }
}

/// Counter-clockwise triangle facing +Z
pub fn triangle() -> (Vec<Vertex>, Vec<u32>) {
    let vertices = vec![
        Vertex::new([-0.5, -0.5, 0.0].into(), Vec3::Z, [0.0, 1.0].into()), // Bottom left
        Vertex::new([0.5, -0.5, 0.0].into(), Vec3::Z, [1.0, 1.0].into()), // Bottom right
        Vertex::new([0.0, 0.5, 0.0].into(), Vec3::Z, [0.5, 0.0].into()), // Top
    ];

    (vertices, vec![0, 1, 2])
}

/// Full-screen quad, two counter-clockwise triangles
pub fn quad() -> (Vec<Vertex>, Vec<u32>) {
    let vertices = vec![
        Vertex::new([-1.0, 1.0, 0.0].into(), Vec3::Z, [0.0, 0.0].into()), // Top left
        Vertex::new([-1.0, -1.0, 0.0].into(), Vec3::Z, [0.0, 1.0].into()), // Bottom left
        Vertex::new([1.0, 1.0, 0.0].into(), Vec3::Z, [1.0, 0.0].into()), // Top right
        Vertex::new([1.0, -1.0, 0.0].into(), Vec3::Z, [1.0, 1.0].into()), // Bottom right
    ];

    let indices = vec![
        0, 1, 2, // Top left triangle
        2, 1, 3, // Bottom right triangle
    ];

    (vertices, indices)
}
