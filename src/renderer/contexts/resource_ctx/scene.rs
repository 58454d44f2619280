use std::collections::HashMap;
use glam::{EulerRot, Quat, Vec3};
use crate::renderer::contexts::device_ctx::transfer_ctx::TransferContext;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::error::{RegistryKind, RegistryScope, RenderError, Result};
use crate::renderer::resources::buffer::{BufferCreateInfo, IndexBufferView, VertexBufferView};
use crate::renderer::resources::desc::ResourceState;
use crate::renderer::resources::vertex::Vertex;

pub const VERTEX_BUFFER_NAME: &str = "VertexBuffer";
pub const INDEX_BUFFER_NAME: &str = "IndexBuffer";

/// Where a mesh lives inside the shared vertex and index buffers.
/// Indices are relative to `start_vertex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshInfo {
    pub start_vertex: u32,
    pub vertex_count: u32,
    pub start_index: u32,
    pub index_count: u32,
}

/// Applied to positions and normals when a mesh is loaded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshTransform {
    /// Degrees around the X, Y and Z axes
    pub rotation: Vec3,
    pub scale: f32,
}

impl Default for MeshTransform {
    fn default() -> Self {
        Self {
            rotation: Vec3::ZERO,
            scale: 1.0,
        }
    }
}

/// Packs every mesh into one vertex buffer and one index buffer
#[derive(Debug, Default)]
pub struct SceneGeometry {
    meshes: HashMap<String, MeshInfo>,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,

    vertex_buffer_view: Option<VertexBufferView>,
    index_buffer_view: Option<IndexBufferView>,
}

impl SceneGeometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_mesh(
        &mut self,
        name: &str,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<MeshInfo> {
        self.load_mesh_transformed(name, vertices, indices, MeshTransform::default())
    }

    pub fn load_mesh_transformed(
        &mut self,
        name: &str,
        vertices: &[Vertex],
        indices: &[u32],
        transform: MeshTransform,
    ) -> Result<MeshInfo> {
        if self.is_uploaded() {
            return Err(RenderError::InvalidCreateInfo {
                name: name.to_string(),
                reason: "scene geometry has already been uploaded".to_string(),
            });
        }
        if self.meshes.contains_key(name) {
            return Err(RenderError::DuplicateName {
                kind: RegistryKind::Mesh,
                name: name.to_string(),
                scope: RegistryScope::Unique,
            });
        }
        if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(RenderError::InvalidCreateInfo {
                name: name.to_string(),
                reason: format!("index {} is out of range for {} vertices", index, vertices.len()),
            });
        }

        let rotation = Quat::from_euler(
            EulerRot::YXZ,
            transform.rotation.y.to_radians(),
            transform.rotation.x.to_radians(),
            transform.rotation.z.to_radians(),
        );
        let info = MeshInfo {
            start_vertex: self.vertices.len() as u32,
            vertex_count: vertices.len() as u32,
            start_index: self.indices.len() as u32,
            index_count: indices.len() as u32,
        };

        self.vertices.extend(vertices.iter().map(|v| Vertex {
            position: rotation * (v.position * transform.scale),
            normal: (rotation * v.normal).normalize_or_zero(),
            uv: v.uv,
        }));
        self.indices.extend_from_slice(indices);
        self.meshes.insert(name.to_string(), info);

        Ok(info)
    }

    pub fn mesh(&self, name: &str) -> Result<MeshInfo> {
        self.meshes
            .get(name)
            .copied()
            .ok_or_else(|| RenderError::UnknownMesh(name.to_string()))
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn is_uploaded(&self) -> bool {
        self.vertex_buffer_view.is_some()
    }

    /// Creates the unique vertex and index buffers, copies every loaded mesh into them
    /// and stalls until the copy is done, after which the staging memory is freed.
    /// Further meshes cannot be loaded afterwards.
    pub fn upload_meshes(
        &mut self,
        resources: &mut RenderResourceContext,
        transfer: &TransferContext,
    ) -> Result<()> {
        if self.is_uploaded() {
            return Err(RenderError::InvalidCreateInfo {
                name: VERTEX_BUFFER_NAME.to_string(),
                reason: "scene geometry has already been uploaded".to_string(),
            });
        }
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(RenderError::InvalidCreateInfo {
                name: VERTEX_BUFFER_NAME.to_string(),
                reason: "no meshes have been loaded".to_string(),
            });
        }

        for name in [VERTEX_BUFFER_NAME, INDEX_BUFFER_NAME] {
            resources.unique().buffers.ensure_vacant(name)?;
        }

        // A failed upload leaves neither buffer registered, so it can be retried
        let mut registered = Vec::with_capacity(2);
        if let Err(e) = self.stage_and_copy(resources, transfer, &mut registered) {
            for name in registered {
                if let Err(remove_err) = resources.remove_unique_buffer(name) {
                    log::error!("Failed to unregister '{}' after a failed upload: {}", name, remove_err);
                }
            }
            return Err(e);
        }

        let vertex_buffer = resources.unique_buffer_mut(VERTEX_BUFFER_NAME)?;
        vertex_buffer.release_staging();
        self.vertex_buffer_view = Some(vertex_buffer.vertex_buffer_view()?);

        let index_buffer = resources.unique_buffer_mut(INDEX_BUFFER_NAME)?;
        index_buffer.release_staging();
        self.index_buffer_view = Some(index_buffer.index_buffer_view()?);

        log::info!(
            "Uploaded {} meshes: {} vertices, {} indices",
            self.meshes.len(), self.vertices.len(), self.indices.len()
        );

        Ok(())
    }

    fn stage_and_copy(
        &self,
        resources: &mut RenderResourceContext,
        transfer: &TransferContext,
        registered: &mut Vec<&'static str>,
    ) -> Result<()> {
        resources
            .create_buffer_in_unique(&BufferCreateInfo::new(
                VERTEX_BUFFER_NAME,
                self.vertices.len() as u64,
                Vertex::STRIDE,
            ))?;
        registered.push(VERTEX_BUFFER_NAME);
        resources.unique_buffer_mut(VERTEX_BUFFER_NAME)?.initialize_upload(None)?;

        resources
            .create_buffer_in_unique(&BufferCreateInfo::new(
                INDEX_BUFFER_NAME,
                self.indices.len() as u64,
                size_of::<u32>() as u32,
            ))?;
        registered.push(INDEX_BUFFER_NAME);
        resources.unique_buffer_mut(INDEX_BUFFER_NAME)?.initialize_upload(None)?;

        transfer.immediate_submit(|encoder| {
            let vertex_buffer = resources.unique_buffer_mut(VERTEX_BUFFER_NAME)?;
            vertex_buffer.transition(encoder, ResourceState::CopyDest)?;
            vertex_buffer.upload_data(encoder, bytemuck::cast_slice(&self.vertices))?;
            vertex_buffer.transition(encoder, ResourceState::VertexAndConstantBuffer)?;

            let index_buffer = resources.unique_buffer_mut(INDEX_BUFFER_NAME)?;
            index_buffer.transition(encoder, ResourceState::CopyDest)?;
            index_buffer.upload_data(encoder, bytemuck::cast_slice(&self.indices))?;
            index_buffer.transition(encoder, ResourceState::IndexBuffer)?;

            Ok(())
        })
    }

    pub fn vertex_buffer_view(&self) -> Option<VertexBufferView> {
        self.vertex_buffer_view
    }

    pub fn index_buffer_view(&self) -> Option<IndexBufferView> {
        self.index_buffer_view
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::config::RenderConfig;
    use crate::renderer::contexts::device_ctx::device::RenderDevice;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};
    use crate::renderer::resources::desc::Format;
    use crate::renderer::resources::vertex::{quad, triangle};

    #[test]
    fn meshes_are_packed_back_to_back() {
        let mut scene = SceneGeometry::new();
        let (tri_vertices, tri_indices) = triangle();
        let (quad_vertices, quad_indices) = quad();

        let tri = scene.load_mesh("Triangle", &tri_vertices, &tri_indices).unwrap();
        let quad = scene.load_mesh("Quad", &quad_vertices, &quad_indices).unwrap();

        assert_eq!(tri, MeshInfo { start_vertex: 0, vertex_count: 3, start_index: 0, index_count: 3 });
        assert_eq!(quad, MeshInfo { start_vertex: 3, vertex_count: 4, start_index: 3, index_count: 6 });
        assert_eq!(scene.mesh("Quad").unwrap(), quad);
        assert!(matches!(scene.mesh("Cube"), Err(RenderError::UnknownMesh(_))));
        assert!(matches!(
            scene.load_mesh("Quad", &quad_vertices, &quad_indices),
            Err(RenderError::DuplicateName { kind: RegistryKind::Mesh, .. })
        ));
        assert!(scene.load_mesh("Broken", &tri_vertices, &[0, 1, 3]).is_err());
        assert_eq!(scene.vertices().len(), 7);
    }

    #[test]
    fn transforms_scale_and_rotate() {
        let mut scene = SceneGeometry::new();
        let (vertices, indices) = triangle();
        scene.load_mesh_transformed("Turned", &vertices, &indices, MeshTransform {
            rotation: Vec3::new(0.0, 180.0, 0.0),
            scale: 2.0,
        }).unwrap();

        let top = scene.vertices()[2];
        assert!((top.position - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-5);
        assert!((top.normal - Vec3::NEG_Z).length() < 1e-5);
        assert_eq!(top.uv, vertices[2].uv);
    }

    #[test]
    fn upload_fills_the_shared_buffers_and_frees_staging() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let transfer = TransferContext::new(device.clone()).unwrap();
        let mut resources = RenderResourceContext::new(&device, &RenderConfig::default()).unwrap();

        let mut scene = SceneGeometry::new();
        let (vertices, indices) = quad();
        scene.load_mesh("Quad", &vertices, &indices).unwrap();
        scene.upload_meshes(&mut resources, &transfer).unwrap();

        let vertex_buffer = resources.unique_buffer(VERTEX_BUFFER_NAME).unwrap();
        assert_eq!(backend.contents(vertex_buffer.id()).unwrap(), bytemuck::cast_slice::<Vertex, u8>(&vertices));
        assert_eq!(vertex_buffer.state(), ResourceState::VertexAndConstantBuffer);
        assert!(!vertex_buffer.has_staging());

        let index_buffer = resources.unique_buffer(INDEX_BUFFER_NAME).unwrap();
        assert_eq!(backend.resource_state(index_buffer.id()).unwrap(), ResourceState::IndexBuffer);

        // Only the two scene buffers are left
        assert_eq!(backend.live_resource_count(), 2);
        assert_eq!(backend.stats().fence_waits, 1);

        let view = scene.vertex_buffer_view().unwrap();
        assert_eq!(view.stride, Vertex::STRIDE);
        assert_eq!(view.size_in_bytes, 4 * Vertex::STRIDE as u64);
        assert_eq!(scene.index_buffer_view().unwrap().format, Format::R32Uint);

        assert!(scene.upload_meshes(&mut resources, &transfer).is_err());
        assert!(scene.load_mesh("Late", &vertices, &indices).is_err());
    }

    #[test]
    fn empty_scenes_are_not_uploaded() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let transfer = TransferContext::new(device.clone()).unwrap();
        let mut resources = RenderResourceContext::new(&device, &RenderConfig::default()).unwrap();

        assert!(SceneGeometry::new().upload_meshes(&mut resources, &transfer).is_err());
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn failed_uploads_leave_nothing_registered() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc {
            // Room for the vertex buffer and its staging, not for the index buffer
            memory_budget: 2 * 4 * Vertex::STRIDE as u64 + 8,
            ..Default::default()
        }));
        let device = RenderDevice::new(backend.clone());
        let transfer = TransferContext::new(device.clone()).unwrap();
        let mut resources = RenderResourceContext::new(&device, &RenderConfig::default()).unwrap();

        let mut scene = SceneGeometry::new();
        let (vertices, indices) = quad();
        scene.load_mesh("Quad", &vertices, &indices).unwrap();

        assert!(matches!(scene.upload_meshes(&mut resources, &transfer), Err(RenderError::Device(_))));
        assert!(!scene.is_uploaded());
        assert!(resources.unique().is_empty());
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn upload_can_be_retried_once_the_names_are_free() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let transfer = TransferContext::new(device.clone()).unwrap();
        let mut resources = RenderResourceContext::new(&device, &RenderConfig::default()).unwrap();
        resources.create_buffer_in_unique(&BufferCreateInfo::new(INDEX_BUFFER_NAME, 1, 4)).unwrap();

        let mut scene = SceneGeometry::new();
        let (vertices, indices) = triangle();
        scene.load_mesh("Triangle", &vertices, &indices).unwrap();

        assert!(matches!(
            scene.upload_meshes(&mut resources, &transfer),
            Err(RenderError::DuplicateName { .. })
        ));
        assert!(resources.unique_buffer(VERTEX_BUFFER_NAME).is_err());
        assert_eq!(backend.live_resource_count(), 1);

        drop(resources.remove_unique_buffer(INDEX_BUFFER_NAME).unwrap());
        scene.upload_meshes(&mut resources, &transfer).unwrap();
        assert!(scene.is_uploaded());
        assert_eq!(backend.live_resource_count(), 2);
    }
}
