// SPDX-License-Identifier: CEPL-1.0
use anyhow::{ensure, Result};
use chopper_core::FatalError;
use chopper_render::{MeshBuilder, MeshData, TextureData, Vertex};
use glam::Vec3;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

fn asset_error(path: &Path, reason: impl ToString) -> FatalError {
    FatalError::AssetLoad {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

pub fn load_mesh(path: &Path) -> Result<MeshData> {
    let file = File::open(path).map_err(|e| asset_error(path, e))?;
    let mesh =
        mesh_from_obj(&mut BufReader::new(file)).map_err(|e| asset_error(path, format!("{e:#}")))?;
    info!(
        "assets: {} -> {} vertices, {} indices",
        path.display(),
        mesh.vertices.len(),
        mesh.indices.len()
    );
    Ok(mesh)
}

/// Triangulated OBJ to a deduplicated mesh. Materials are ignored; texture V
/// is flipped so the top image row samples at v = 0.
pub fn mesh_from_obj<R: BufRead>(reader: &mut R) -> Result<MeshData> {
    let (models, _) = tobj::load_obj_buf(
        reader,
        &tobj::LoadOptions {
            triangulate: true,
            ..Default::default()
        },
        |_| Ok(Default::default()),
    )?;

    let mut builder = MeshBuilder::new();
    for model in &models {
        let m = &model.mesh;
        let tex_indices = if m.texcoord_indices.is_empty() {
            &m.indices
        } else {
            &m.texcoord_indices
        };
        for (corner, &index) in m.indices.iter().enumerate() {
            let p = 3 * index as usize;
            let color = if m.vertex_color.len() >= p + 3 {
                [m.vertex_color[p], m.vertex_color[p + 1], m.vertex_color[p + 2]]
            } else {
                [1.0, 1.0, 1.0]
            };
            let uv = match tex_indices.get(corner) {
                Some(&t) if m.texcoords.len() >= 2 * t as usize + 2 => {
                    let t = 2 * t as usize;
                    [m.texcoords[t], 1.0 - m.texcoords[t + 1]]
                }
                _ => [0.0, 0.0],
            };
            builder.push(Vertex::new(
                [m.positions[p], m.positions[p + 1], m.positions[p + 2]],
                color,
                uv,
            ));
        }
    }
    let mesh = builder.finish();
    ensure!(!mesh.is_empty(), "no faces");
    Ok(mesh)
}

pub fn load_texture(path: &Path) -> Result<TextureData> {
    let img = image::open(path)
        .map_err(|e| asset_error(path, e))?
        .into_rgba8();
    let (width, height) = img.dimensions();
    info!("assets: {} -> {width}x{height} RGBA8", path.display());
    TextureData::new(width, height, img.into_raw())
}

/// Unit cube centred on the origin, counter-clockwise when seen from outside,
/// one tinted quad per face.
pub fn builtin_cube() -> MeshData {
    // (outward normal, u axis, v axis) with u x v = normal.
    let faces: [(Vec3, Vec3, Vec3, [f32; 3]); 6] = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y, [1.0, 0.8, 0.8]),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y, [0.8, 1.0, 0.8]),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z, [0.8, 0.8, 1.0]),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z, [1.0, 1.0, 0.8]),
        (Vec3::Z, Vec3::X, Vec3::Y, [1.0, 0.8, 1.0]),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y, [0.8, 1.0, 1.0]),
    ];

    let mut builder = MeshBuilder::new();
    for (n, u, v, color) in faces {
        let c = n * 0.5;
        let (u, v) = (u * 0.5, v * 0.5);
        let corner = |p: Vec3, uv: [f32; 2]| Vertex::new(p.to_array(), color, uv);
        let q = [
            corner(c - u - v, [0.0, 1.0]),
            corner(c + u - v, [1.0, 1.0]),
            corner(c + u + v, [1.0, 0.0]),
            corner(c - u + v, [0.0, 0.0]),
        ];
        builder.push_triangle(q[0], q[1], q[2]);
        builder.push_triangle(q[0], q[2], q[3]);
    }
    builder.finish()
}

pub const CHECKER_SIZE: u32 = 512;
const CHECKER_CELL: u32 = 64;

pub fn builtin_checkerboard() -> Result<TextureData> {
    let mut pixels = Vec::with_capacity((CHECKER_SIZE * CHECKER_SIZE * 4) as usize);
    for y in 0..CHECKER_SIZE {
        for x in 0..CHECKER_SIZE {
            let light = ((x / CHECKER_CELL) + (y / CHECKER_CELL)) % 2 == 0;
            let c = if light { 0xE0 } else { 0x30 };
            pixels.extend_from_slice(&[c, c, c, 0xFF]);
        }
    }
    TextureData::new(CHECKER_SIZE, CHECKER_SIZE, pixels)
}
