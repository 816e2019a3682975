//! Geometry handed to the pipeline each frame.

use bytemuck::{Pod, Zeroable};

/// A vertex in normalized device coordinates. `position[2]` is the depth in
/// `[0, 1]`; `color` is straight (not premultiplied) RGB plus alpha.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

/// A non-indexed triangle list. Color is flat per triangle and taken from its
/// first vertex. `surface` identifies the batch to the dither hash, so it
/// should stay stable across frames and distinct between batches.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshBatch {
    pub surface: u32,
    pub vertices: Vec<Vertex>,
}

impl MeshBatch {
    pub fn new(surface: u32, vertices: Vec<Vertex>) -> Self {
        Self { surface, vertices }
    }

    /// Axis-aligned rectangle `[x0, y0, x1, y1]` in NDC at a constant depth.
    pub fn quad(surface: u32, rect: [f32; 4], depth: f32, color: [f32; 4]) -> Self {
        let [x0, y0, x1, y1] = rect;
        let corner = |x: f32, y: f32| Vertex {
            position: [x, y, depth],
            color,
        };
        let vertices = vec![
            corner(x0, y0),
            corner(x1, y0),
            corner(x1, y1),
            corner(x0, y0),
            corner(x1, y1),
            corner(x0, y1),
        ];
        Self { surface, vertices }
    }

    /// Quad covering the whole viewport.
    pub fn full_screen(surface: u32, depth: f32, color: [f32; 4]) -> Self {
        Self::quad(surface, [-1.0, -1.0, 1.0, 1.0], depth, color)
    }

    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn triangles(&self) -> impl Iterator<Item = &[Vertex]> + '_ {
        self.vertices.chunks_exact(3)
    }
}

/// Source of opaque and transparent batches. Both sequences must be
/// restartable: the transparent batches are walked once per geometry pass.
pub trait SceneGeometry {
    fn opaque_batches(&self) -> Box<dyn Iterator<Item = &MeshBatch> + '_> {
        Box::new(std::iter::empty())
    }

    fn transparent_batches(&self) -> Box<dyn Iterator<Item = &MeshBatch> + '_>;
}

/// A scene that is just two lists of batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchList {
    pub opaque: Vec<MeshBatch>,
    pub transparent: Vec<MeshBatch>,
}

impl BatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transparent(transparent: Vec<MeshBatch>) -> Self {
        Self {
            opaque: Vec::new(),
            transparent,
        }
    }
}

impl SceneGeometry for BatchList {
    fn opaque_batches(&self) -> Box<dyn Iterator<Item = &MeshBatch> + '_> {
        Box::new(self.opaque.iter())
    }

    fn transparent_batches(&self) -> Box<dyn Iterator<Item = &MeshBatch> + '_> {
        Box::new(self.transparent.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_is_two_triangles_with_shared_diagonal() {
        let quad = MeshBatch::quad(3, [-0.5, -0.5, 0.5, 0.5], 0.25, [1.0, 0.0, 0.0, 0.5]);
        assert_eq!(quad.triangle_count(), 2);
        let triangles: Vec<_> = quad.triangles().collect();
        assert_eq!(triangles[0][0].position, triangles[1][0].position);
        assert_eq!(triangles[0][2].position, triangles[1][1].position);
        assert!(quad.vertices.iter().all(|v| v.position[2] == 0.25));
    }

    #[test]
    fn batch_list_restarts() {
        let scene = BatchList::with_transparent(vec![MeshBatch::full_screen(
            1,
            0.5,
            [0.0, 1.0, 0.0, 0.5],
        )]);
        assert_eq!(scene.transparent_batches().count(), 1);
        assert_eq!(scene.transparent_batches().count(), 1);
        assert_eq!(scene.opaque_batches().count(), 0);
    }
}
