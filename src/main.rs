use bytemuck::{Pod, Zeroable};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use glam::{Mat4, Vec3};
use framekeep::renderer::config::RenderConfig;
use framekeep::renderer::resources::constant_buffer::ConstantBufferCreateInfo;
use framekeep::renderer::resources::desc::{Format, ResourceState};
use framekeep::renderer::resources::texture::TextureCreateInfo;
use framekeep::renderer::resources::vertex;
use framekeep::renderer::{Renderer, BACK_BUFFER_NAME};

const DEFAULT_CONFIG_PATH: &str = "framekeep.toml";
const DEFAULT_FRAME_COUNT: u64 = 120;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CameraConstants {
    view_proj: Mat4,
    eye: [f32; 4],
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let frame_count = match args.next() {
        Some(count) => count.parse().wrap_err("Frame count must be a number")?,
        None => DEFAULT_FRAME_COUNT,
    };

    let config = RenderConfig::load_or_default(&config_path)?;
    let (width, height) = (config.back_buffer_width, config.back_buffer_height);
    let mut renderer = Renderer::new(config)?;

    let (triangle_vertices, triangle_indices) = vertex::triangle();
    let (quad_vertices, quad_indices) = vertex::quad();
    renderer.scene_mut().load_mesh("Triangle", &triangle_vertices, &triangle_indices)?;
    renderer.scene_mut().load_mesh("Quad", &quad_vertices, &quad_indices)?;
    renderer.upload_scene()?;

    for slot in 0..renderer.config().frames_in_flight {
        let resources = renderer.resources_mut();
        resources.create_constant_buffer_in_frame(slot, &ConstantBufferCreateInfo::of::<CameraConstants>("Camera", 1))?;
        resources.create_texture_in_frame(
            slot,
            &TextureCreateInfo::new_2d("Depth", Format::D32Float, width, height).depth_stencil(1.0, 0),
        )?;
    }

    let projection = Mat4::perspective_rh(60f32.to_radians(), width as f32 / height as f32, 0.1, 100.0);
    for frame in 0..frame_count {
        renderer.begin_frame()?;
        let (token, resources, encoder) = renderer.frame_mut()?;

        let angle = frame as f32 * 0.02;
        let eye = Vec3::new(angle.sin() * 3.0, 1.0, angle.cos() * 3.0);
        let camera = resources.constant_buffer_mut("Camera", token.slot)?;
        camera.upload_element(0, &CameraConstants {
            view_proj: projection * Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y),
            eye: eye.extend(1.0).to_array(),
        })?;
        camera.element_view(0)?;

        let depth = resources.texture_mut("Depth", token.slot)?;
        depth.transition(encoder, ResourceState::DepthWrite)?;
        depth.depth_stencil_view(None)?;

        let back_buffer = resources.texture_mut(BACK_BUFFER_NAME, token.slot)?;
        back_buffer.transition(encoder, ResourceState::RenderTarget)?;
        back_buffer.render_target_view(None)?;
        back_buffer.transition(encoder, ResourceState::Present)?;

        renderer.end_frame()?;
    }

    renderer.shutdown()?;
    log::info!("Rendered {} frames", frame_count);

    Ok(())
}
