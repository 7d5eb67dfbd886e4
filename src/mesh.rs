// Geometry and uniform layouts shared between CPU and shaders
//
// Vertex: position (2 floats), color (3 floats), tex coord (2 floats),
// tightly packed in a single per-vertex binding.
// Uniform block: model/view/projection matrices, 16-byte aligned.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::mem::{offset_of, size_of};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub const fn new(pos: [f32; 2], color: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self { pos, color, tex_coord }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, pos) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, tex_coord) as u32)
                .build(),
        ]
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0], [1.0, 0.0]),
    Vertex::new([0.5, -0.5], [0.0, 1.0, 0.0], [0.0, 0.0]),
    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0], [0.0, 1.0]),
    Vertex::new([-0.5, 0.5], [1.0, 1.0, 1.0], [1.0, 1.0]),
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Per-frame transform block, written straight into a mapped uniform buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Quad spinning 90 degrees per second around Z, seen from (2, 2, 2).
    pub fn spinning(elapsed_secs: f32, extent: vk::Extent2D) -> Self {
        let model = Mat4::from_rotation_z(elapsed_secs * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(size_of::<Vertex>(), 7 * size_of::<f32>());
        assert_eq!(Vertex::binding_description().stride, 28);

        let offsets: Vec<u32> = Vertex::attribute_descriptions().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 8, 20]);

        let locations: Vec<u32> = Vertex::attribute_descriptions().iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
    }

    #[test]
    fn quad_indices_reference_every_vertex() {
        for i in 0..QUAD_VERTICES.len() as u16 {
            assert!(QUAD_INDICES.contains(&i));
        }
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn uniform_block_matches_shader_layout() {
        assert_eq!(size_of::<UniformBufferObject>(), 3 * 64);
        assert_eq!(std::mem::align_of::<UniformBufferObject>(), 16);
        assert_eq!(offset_of!(UniformBufferObject, view), 64);
        assert_eq!(offset_of!(UniformBufferObject, proj), 128);
    }

    #[test]
    fn model_starts_unrotated() {
        let ubo = UniformBufferObject::spinning(0.0, vk::Extent2D { width: 800, height: 600 });
        assert!(ubo.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn projection_flips_y() {
        let ubo = UniformBufferObject::spinning(1.0, vk::Extent2D { width: 600, height: 600 });
        assert!(ubo.proj.y_axis.y < 0.0);
        assert!(ubo.proj.x_axis.x > 0.0);
        assert!((ubo.proj.x_axis.x + ubo.proj.y_axis.y).abs() < 1e-5);
    }

    #[test]
    fn zero_height_extent_does_not_divide_by_zero() {
        let ubo = UniformBufferObject::spinning(0.5, vk::Extent2D { width: 10, height: 0 });
        assert!(ubo.proj.is_finite());
    }
}
