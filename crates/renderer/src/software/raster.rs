//! Triangle scan conversion for the software device.
//!
//! Coverage is tested at pixel centers with edge functions. A center lying
//! exactly on an edge belongs to the triangle whose inward edge normal points
//! right, or straight down when the edge is horizontal, so two triangles
//! sharing an edge never both cover a pixel.

use crate::scene::Vertex;

#[derive(Debug, Clone, Copy)]
struct ScreenPoint {
    x: f32,
    y: f32,
    z: f32,
}

fn to_screen(vertex: &Vertex, width: u32, height: u32) -> ScreenPoint {
    let [x, y, z] = vertex.position;
    ScreenPoint {
        x: (x * 0.5 + 0.5) * width as f32,
        y: (0.5 - y * 0.5) * height as f32,
        z,
    }
}

// Positive when `p` is on the interior side of `a -> b` for a positively
// oriented triangle.
fn edge(a: ScreenPoint, b: ScreenPoint, px: f32, py: f32) -> f32 {
    (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x)
}

fn owns_boundary(a: ScreenPoint, b: ScreenPoint) -> bool {
    let nx = a.y - b.y;
    let ny = b.x - a.x;
    nx > 0.0 || (nx == 0.0 && ny > 0.0)
}

fn inside(weight: f32, owns: bool) -> bool {
    weight > 0.0 || (weight == 0.0 && owns)
}

/// Calls `emit(x, y, depth)` for every covered pixel center whose
/// interpolated depth lies in `[0, 1]`.
pub(crate) fn rasterize_triangle<F>(width: u32, height: u32, triangle: &[Vertex], mut emit: F)
where
    F: FnMut(u32, u32, f32),
{
    let [v0, v1, v2] = match triangle {
        [a, b, c] => [a, b, c],
        _ => return,
    };
    let a = to_screen(v0, width, height);
    let mut b = to_screen(v1, width, height);
    let mut c = to_screen(v2, width, height);

    let mut area = edge(a, b, c.x, c.y);
    if !area.is_finite() || area == 0.0 {
        return;
    }
    if area < 0.0 {
        std::mem::swap(&mut b, &mut c);
        area = -area;
    }

    let min_x = a.x.min(b.x).min(c.x).floor().max(0.0);
    let min_y = a.y.min(b.y).min(c.y).floor().max(0.0);
    let max_x = a.x.max(b.x).max(c.x).ceil().min(width as f32);
    let max_y = a.y.max(b.y).max(c.y).ceil().min(height as f32);
    if min_x >= max_x || min_y >= max_y {
        return;
    }

    let owns_bc = owns_boundary(b, c);
    let owns_ca = owns_boundary(c, a);
    let owns_ab = owns_boundary(a, b);

    for y in min_y as u32..max_y as u32 {
        let py = y as f32 + 0.5;
        for x in min_x as u32..max_x as u32 {
            let px = x as f32 + 0.5;
            let w0 = edge(b, c, px, py);
            let w1 = edge(c, a, px, py);
            let w2 = edge(a, b, px, py);
            if !(inside(w0, owns_bc) && inside(w1, owns_ca) && inside(w2, owns_ab)) {
                continue;
            }
            let l1 = w1 / area;
            let l2 = w2 / area;
            let depth = a.z + l1 * (b.z - a.z) + l2 * (c.z - a.z);
            if !(0.0..=1.0).contains(&depth) {
                continue;
            }
            emit(x, y, depth);
        }
    }
}
