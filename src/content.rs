// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deterministic input pictures: a dot moving over a gradient.

use crate::nv12_frame_size;
use crate::nv12_luma_size;
use crate::Resolution;

/// Position of `frame` in the animation, in radians.
fn frame_phase(frame: usize, num_frames: usize) -> f32 {
    2.0 * std::f32::consts::PI * (frame as f32) / (num_frames.max(1) as f32)
}

/// Calls `set_pix` with the normalized YUV value of every pixel of a `resolution` picture at
/// phase `t`.
fn gen_test_frame<F>(resolution: Resolution, t: f32, mut set_pix: F)
where
    F: FnMut(usize, usize, [f32; 3]),
{
    let width = resolution.width as f32;
    let height = resolution.height as f32;
    let (sin, cos) = f32::sin_cos(t);
    let (sin2, cos2) = (sin.powi(2), cos.powi(2));

    let dot_col = width * (1.1 + 2.0 * sin * cos) / 2.2;
    let dot_row = height * (1.1 + sin) / 2.2;
    let dot_size2 = (width.min(height) * 0.05).powi(2);

    for frame_row in 0..resolution.height as usize {
        for frame_col in 0..resolution.width as usize {
            let row = frame_row as f32;
            let col = frame_col as f32;

            let in_dot = (dot_col - col).powi(2) + (dot_row - row).powi(2) < dot_size2;
            let yuv = if in_dot {
                [0.0, 0.5, 0.5]
            } else {
                [
                    (row + col) / (width + height),
                    (row / height) * sin2,
                    (col / width) * cos2,
                ]
            };

            set_pix(frame_col, frame_row, yuv);
        }
    }
}

/// Renders `frame` of a `num_frames` long animation of `resolution` into `raw`, a NV12 surface of
/// `surface` without padding. Pixels of the surface outside of `resolution` are left untouched.
pub fn fill_test_frame_nv12(
    resolution: Resolution,
    surface: Resolution,
    frame: usize,
    num_frames: usize,
    raw: &mut [u8],
) {
    const MAX_COMP_VAL: f32 = 0xff as f32;

    let y_stride = surface.width as usize;
    let uv_stride = (y_stride + 1) / 2 * 2;
    let uv_offset = nv12_luma_size(surface);

    gen_test_frame(resolution, frame_phase(frame, num_frames), |col, row, yuv| {
        let [y, u, v] = yuv.map(|c| (c * MAX_COMP_VAL).clamp(0.0, MAX_COMP_VAL) as u8);

        raw[row * y_stride + col] = y;

        // Subsample with upper left pixel
        if col % 2 == 0 && row % 2 == 0 {
            let u_pos = uv_offset + (row / 2) * uv_stride + col;
            raw[u_pos] = u;
            raw[u_pos + 1] = v;
        }
    });
}

/// Renders every input picture of a stream, one worker thread per picture.
///
/// All workers are joined before returning.
pub fn generate_stream_inputs(
    resolution: Resolution,
    surface: Resolution,
    num_frames: usize,
) -> Vec<Vec<u8>> {
    let size = nv12_frame_size(surface);
    let mut frames = vec![vec![0u8; size]; num_frames];

    std::thread::scope(|s| {
        for (frame, raw) in frames.iter_mut().enumerate() {
            s.spawn(move || fill_test_frame_nv12(resolution, surface, frame, num_frames, raw));
        }
    });

    log::trace!("generated {} input pictures of {:?}", num_frames, resolution);

    frames
}
