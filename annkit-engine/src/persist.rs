//! Single-file index persistence.
//!
//! Layout: 8-byte magic, `u32` format version, `u64` header length, JSON
//! header, then the little-endian structure sections. Vectors are not
//! stored; loading needs the same points the index was built on.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::ArrayView2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::index::{NnIndex, Structure};
use crate::kdtree::KdForest;
use crate::kmeans_tree::KMeansTree;
use crate::params::BuildParams;
use crate::store::PointStore;

const MAGIC: &[u8; 8] = b"ANNKIDX\0";
const FORMAT_VERSION: u32 = 1;
const MAX_HEADER_LEN: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum StructureKind {
    Linear,
    KdForest,
    KMeans,
    Composite,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexHeader {
    kind: StructureKind,
    params: BuildParams,
    num_points: usize,
    dim: usize,
    built_size: usize,
    removed: Vec<usize>,
}

pub(crate) fn save(index: &NnIndex, path: &Path) -> Result<()> {
    let kind = match &index.structure {
        Structure::Linear => StructureKind::Linear,
        Structure::KdForest(_) => StructureKind::KdForest,
        Structure::KMeans(_) => StructureKind::KMeans,
        Structure::Composite { .. } => StructureKind::Composite,
    };
    let header = IndexHeader {
        kind,
        params: index.params.clone(),
        num_points: index.store.len(),
        dim: index.store.dim(),
        built_size: index.built_size,
        removed: index.store.removed_ids(),
    };
    let header_bytes = serde_json::to_vec(&header)?;

    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    w.write_u64::<LittleEndian>(header_bytes.len() as u64)?;
    w.write_all(&header_bytes)?;
    match &index.structure {
        Structure::Linear => {}
        Structure::KdForest(forest) => forest.write_to(&mut w)?,
        Structure::KMeans(tree) => tree.write_to(&mut w)?,
        Structure::Composite { forest, tree } => {
            forest.write_to(&mut w)?;
            tree.write_to(&mut w)?;
        }
    }
    w.flush()?;
    Ok(())
}

pub(crate) fn load(path: &Path, points: ArrayView2<f32>) -> Result<NnIndex> {
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)
        .map_err(|_| Error::CorruptedIndex("file too short".into()))?;
    if &magic != MAGIC {
        return Err(Error::CorruptedIndex("bad magic".into()));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(Error::CorruptedIndex(format!(
            "unsupported format version {}",
            version
        )));
    }
    let header_len = r.read_u64::<LittleEndian>()?;
    if header_len > MAX_HEADER_LEN {
        return Err(Error::CorruptedIndex("header length out of range".into()));
    }
    let mut header_bytes = vec![0u8; header_len as usize];
    r.read_exact(&mut header_bytes)?;
    let header: IndexHeader = serde_json::from_slice(&header_bytes)?;

    if points.nrows() != header.num_points {
        return Err(Error::PointCountMismatch {
            expected: header.num_points,
            got: points.nrows(),
        });
    }
    if points.ncols() != header.dim {
        return Err(Error::DimensionMismatch {
            expected: header.dim,
            got: points.ncols(),
        });
    }

    let store = PointStore::with_removed(points, &header.removed)
        .map_err(|e| Error::CorruptedIndex(format!("removed ids: {}", e)))?;
    let n = header.num_points;
    let dim = header.dim;
    let structure = match header.kind {
        StructureKind::Linear => Structure::Linear,
        StructureKind::KdForest => Structure::KdForest(KdForest::read_from(&mut r, n, dim)?),
        StructureKind::KMeans => {
            Structure::KMeans(KMeansTree::read_from(&mut r, &header.params, n, dim)?)
        }
        StructureKind::Composite => Structure::Composite {
            forest: KdForest::read_from(&mut r, n, dim)?,
            tree: KMeansTree::read_from(&mut r, &header.params, n, dim)?,
        },
    };

    let rng = ChaCha8Rng::seed_from_u64(header.params.random_seed ^ n as u64);
    Ok(NnIndex {
        params: header.params,
        structure,
        store,
        built_size: header.built_size,
        rng,
    })
}
