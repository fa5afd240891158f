// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion between the NV12MT layout produced by the hardware and linear I420.
//!
//! NV12MT stores each plane as 64x32 byte tiles. Tiles are grouped by four horizontally and two
//! vertically, and the eight tiles of a group are laid out in a Z / reverse-Z order. When a
//! plane has an odd number of tile rows, the tiles of the last row are simply laid out left to
//! right. The chroma plane is half the height of the luma one and holds interleaved CbCr pairs.
//!
//! Widths and heights are expected to be even, as they always are for this hardware.

pub const TILE_WIDTH: usize = 64;
pub const TILE_HEIGHT: usize = 32;
const TILE_SIZE: usize = TILE_WIDTH * TILE_HEIGHT;

/// Position of a tile within its 4x2 group, indexed by `(x % 4) + (y % 2) * 4`.
const Z_ORDER: [usize; 8] = [0, 1, 6, 7, 2, 3, 4, 5];

/// Tile addressing of one plane with `width` bytes per line and `rows` lines.
#[derive(Copy, Clone, Debug)]
struct TileGeometry {
    width: usize,
    rows: usize,
    /// Tiles per row, always rounded up to a whole number of 4x2 groups horizontally.
    row_tiles: usize,
    col_tiles: usize,
}

impl TileGeometry {
    fn new(width: usize, rows: usize) -> Self {
        Self {
            width,
            rows,
            row_tiles: width.div_ceil(128) * 2,
            col_tiles: rows.div_ceil(TILE_HEIGHT),
        }
    }

    /// Index of the tile at tile column `x`, tile row `y`.
    fn tile_index(&self, x: usize, y: usize) -> usize {
        let group_row = (y / 2) * self.row_tiles * 2;

        if self.col_tiles % 2 == 1 && y == self.col_tiles - 1 {
            group_row + x
        } else {
            group_row + (x / 4) * 8 + Z_ORDER[x % 4 + (y % 2) * 4]
        }
    }

    fn size(&self) -> usize {
        self.row_tiles * self.col_tiles * TILE_SIZE
    }

    /// Iterates over the horizontal runs of the plane that are contiguous in both layouts,
    /// yielding `(line, first byte in line, offset in tiled buffer, length)`.
    fn runs(&self) -> impl Iterator<Item = (usize, usize, usize, usize)> + '_ {
        (0..self.rows).flat_map(move |y| {
            (0..self.width.div_ceil(TILE_WIDTH)).map(move |tx| {
                let x = tx * TILE_WIDTH;
                let tiled = self.tile_index(tx, y / TILE_HEIGHT) * TILE_SIZE
                    + (y % TILE_HEIGHT) * TILE_WIDTH;
                (y, x, tiled, TILE_WIDTH.min(self.width - x))
            })
        })
    }
}

/// Minimum size of a tiled plane of `width`x`rows` bytes.
pub fn tiled_plane_size(width: usize, rows: usize) -> usize {
    TileGeometry::new(width, rows).size()
}

/// Size of a `width`x`height` I420 frame as written by [`detile_luma`] and [`detile_chroma`].
pub fn i420_frame_size(width: usize, height: usize) -> usize {
    width * height * 3 / 2
}

/// Converts a tiled luma plane into a linear one of `width`x`height` bytes.
pub fn detile_luma(dst: &mut [u8], src: &[u8], width: usize, height: usize) {
    for (y, x, tiled, len) in TileGeometry::new(width, height).runs() {
        let linear = y * width + x;
        dst[linear..linear + len].copy_from_slice(&src[tiled..tiled + len]);
    }
}

/// Converts a tiled CbCr plane of a `width`x`height` frame into separate Cb and Cr planes.
///
/// `dst` receives the Cb plane followed by the Cr plane, `width * height / 4` bytes each.
pub fn detile_chroma(dst: &mut [u8], src: &[u8], width: usize, height: usize) {
    let plane_size = width * height / 4;
    let (cb, cr) = dst.split_at_mut(plane_size);

    for (y, x, tiled, len) in TileGeometry::new(width, height / 2).runs() {
        let linear = (y * width + x) / 2;
        let pairs = src[tiled..tiled + len].chunks_exact(2);
        for (i, pair) in pairs.enumerate() {
            cb[linear + i] = pair[0];
            cr[linear + i] = pair[1];
        }
    }
}

/// Inverse of [`detile_luma`].
pub fn tile_luma(dst: &mut [u8], src: &[u8], width: usize, height: usize) {
    for (y, x, tiled, len) in TileGeometry::new(width, height).runs() {
        let linear = y * width + x;
        dst[tiled..tiled + len].copy_from_slice(&src[linear..linear + len]);
    }
}

/// Inverse of [`detile_chroma`].
pub fn tile_chroma(dst: &mut [u8], src: &[u8], width: usize, height: usize) {
    let plane_size = width * height / 4;
    let (cb, cr) = src.split_at(plane_size);

    for (y, x, tiled, len) in TileGeometry::new(width, height / 2).runs() {
        let linear = (y * width + x) / 2;
        let pairs = dst[tiled..tiled + len].chunks_exact_mut(2);
        for (i, pair) in pairs.enumerate() {
            pair[0] = cb[linear + i];
            pair[1] = cr[linear + i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [(usize, usize); 6] =
        [(64, 32), (128, 64), (96, 96), (176, 144), (320, 240), (256, 200)];

    fn pattern(width: usize, rows: usize) -> Vec<u8> {
        (0..rows)
            .flat_map(|y| (0..width).map(move |x| ((x + y * width) % 256) as u8))
            .collect()
    }

    #[test]
    fn luma_round_trip() {
        for (width, height) in SIZES {
            let linear = pattern(width, height);
            let mut tiled = vec![0u8; tiled_plane_size(width, height)];
            let mut back = vec![0u8; width * height];

            tile_luma(&mut tiled, &linear, width, height);
            detile_luma(&mut back, &tiled, width, height);

            assert_eq!(back, linear, "{}x{}", width, height);
        }
    }

    #[test]
    fn chroma_round_trip() {
        for (width, height) in SIZES {
            let planar = pattern(width / 2, height);
            let mut tiled = vec![0u8; tiled_plane_size(width, height / 2)];
            let mut back = vec![0u8; width * height / 2];

            tile_chroma(&mut tiled, &planar, width, height);
            detile_chroma(&mut back, &tiled, width, height);

            assert_eq!(back, planar, "{}x{}", width, height);
        }
    }

    #[test]
    fn tiles_follow_z_order() {
        // Four tiles per row: the third tile of the first row is the 7th tile in memory.
        let width = 256;
        let height = 64;
        let mut tiled = vec![0u8; tiled_plane_size(width, height)];
        tiled[6 * TILE_SIZE] = 0xaa;
        // Second tile row, first column.
        tiled[2 * TILE_SIZE + 3 * TILE_WIDTH + 5] = 0xbb;

        let mut linear = vec![0u8; width * height];
        detile_luma(&mut linear, &tiled, width, height);

        assert_eq!(linear[128], 0xaa);
        assert_eq!(linear[(32 + 3) * width + 5], 0xbb);
    }

    #[test]
    fn odd_last_tile_row_is_linear() {
        let width = 128;
        let height = 96;
        let mut tiled = vec![0u8; tiled_plane_size(width, height)];
        tiled[5 * TILE_SIZE] = 0xcc;

        let mut linear = vec![0u8; width * height];
        detile_luma(&mut linear, &tiled, width, height);

        assert_eq!(linear[64 * width + 64], 0xcc);
    }

    #[test]
    fn chroma_splits_pairs() {
        let width = 64;
        let height = 64;
        let mut tiled = vec![0u8; tiled_plane_size(width, height / 2)];
        tiled[..4].copy_from_slice(&[1, 2, 3, 4]);

        let mut planar = vec![0u8; width * height / 2];
        detile_chroma(&mut planar, &tiled, width, height);

        assert_eq!(&planar[..2], &[1, 3]);
        assert_eq!(&planar[width * height / 4..][..2], &[2, 4]);
    }

    #[test]
    fn sizes() {
        assert_eq!(tiled_plane_size(176, 144), 4 * 5 * TILE_SIZE);
        assert_eq!(i420_frame_size(176, 144), 38016);
    }
}
