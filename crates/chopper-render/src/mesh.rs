// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;

/// Vertex layout consumed by the graphics pipeline (binding 0):
/// location 0 = position, 1 = color, 2 = texcoord.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const fn new(pos: [f32; 3], color: [f32; 3], uv: [f32; 2]) -> Self {
        Self { pos, color, uv }
    }

    // Floats are not Eq/Hash; the bit pattern is, and two vertices written
    // from the same source data share it.
    fn key(&self) -> [u32; 8] {
        let mut k = [0u32; 8];
        for (dst, src) in k
            .iter_mut()
            .zip(self.pos.iter().chain(&self.color).chain(&self.uv))
        {
            *dst = src.to_bits();
        }
        k
    }
}

/// Immutable geometry handed to the renderer: deduplicated vertices plus a
/// triangle list indexing them.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Builds a [`MeshData`] from a stream of triangle corners, emitting each
/// distinct (position, color, texcoord) tuple exactly once.
#[derive(Default)]
pub struct MeshBuilder {
    mesh: MeshData,
    seen: HashMap<[u32; 8], u32>,
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, v: Vertex) {
        let next = self.mesh.vertices.len() as u32;
        let index = *self.seen.entry(v.key()).or_insert_with(|| {
            self.mesh.vertices.push(v);
            next
        });
        self.mesh.indices.push(index);
    }

    pub fn push_triangle(&mut self, a: Vertex, b: Vertex, c: Vertex) {
        self.push(a);
        self.push(b);
        self.push(c);
    }

    pub fn finish(self) -> MeshData {
        self.mesh
    }
}
