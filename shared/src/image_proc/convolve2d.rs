//! 2D convolution for image planes
//!
//! Provides true (kernel-flipped) 2D convolution with zero padding outside the
//! image, returning an output of the same shape as the input ("same" mode).
//! Small kernels are applied directly; larger kernels go through an FFT of the
//! zero-padded linear convolution, which is exact up to floating point error.

use ndarray::{Array2, ArrayView2, Axis};
use num_complex::Complex64;
use rustfft::FftPlanner;

/// Kernels with at most this many taps are applied directly.
pub const DIRECT_KERNEL_LIMIT: usize = 49;

/// Strategy used by [`convolve2d`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolveMethod {
    /// Pick direct or FFT based on kernel size
    Auto,
    /// Direct summation, O(n·k)
    Direct,
    /// FFT of the zero-padded planes, O(n log n)
    Fft,
}

/// Convolve `image` with `kernel`, keeping the image shape.
///
/// The kernel centre is taken at `(rows / 2, cols / 2)`, so odd-sized kernels
/// are centred exactly. Pixels outside the image count as zero.
pub fn convolve2d(
    image: &ArrayView2<f64>,
    kernel: &ArrayView2<f64>,
    method: ConvolveMethod,
) -> Array2<f64> {
    if image.is_empty() || kernel.is_empty() {
        return Array2::zeros(image.dim());
    }

    let use_fft = match method {
        ConvolveMethod::Auto => kernel.len() > DIRECT_KERNEL_LIMIT,
        ConvolveMethod::Direct => false,
        ConvolveMethod::Fft => true,
    };

    if use_fft {
        fft_convolve(image, kernel)
    } else {
        direct_convolve(image, kernel)
    }
}

fn direct_convolve(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();
    let kr = (ker_rows / 2) as isize;
    let kc = (ker_cols / 2) as isize;

    let mut output = Array2::zeros((img_rows, img_cols));

    for ((i, j), out) in output.indexed_iter_mut() {
        let mut sum = 0.0;

        for ki in 0..ker_rows {
            let src_row = i as isize - ki as isize + kr;
            if src_row < 0 || src_row >= img_rows as isize {
                continue;
            }

            for kj in 0..ker_cols {
                let src_col = j as isize - kj as isize + kc;
                if src_col < 0 || src_col >= img_cols as isize {
                    continue;
                }

                sum += image[[src_row as usize, src_col as usize]] * kernel[[ki, kj]];
            }
        }

        *out = sum;
    }

    output
}

fn fft_convolve(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();

    // Full linear convolution size, so the circular FFT product never wraps
    let rows = img_rows + ker_rows - 1;
    let cols = img_cols + ker_cols - 1;

    let mut planner = FftPlanner::<f64>::new();

    let mut image_spectrum = zero_padded(image, rows, cols);
    let mut kernel_spectrum = zero_padded(kernel, rows, cols);
    fft2(&mut image_spectrum, &mut planner, false);
    fft2(&mut kernel_spectrum, &mut planner, false);

    image_spectrum.zip_mut_with(&kernel_spectrum, |a, b| *a *= *b);
    fft2(&mut image_spectrum, &mut planner, true);

    let norm = (rows * cols) as f64;
    let row_offset = ker_rows / 2;
    let col_offset = ker_cols / 2;

    Array2::from_shape_fn((img_rows, img_cols), |(i, j)| {
        image_spectrum[[i + row_offset, j + col_offset]].re / norm
    })
}

fn zero_padded(data: &ArrayView2<f64>, rows: usize, cols: usize) -> Array2<Complex64> {
    let mut padded = Array2::from_elem((rows, cols), Complex64::new(0.0, 0.0));
    for ((i, j), &value) in data.indexed_iter() {
        padded[[i, j]] = Complex64::new(value, 0.0);
    }
    padded
}

/// Unnormalised 2D FFT, rows then columns
fn fft2(data: &mut Array2<Complex64>, planner: &mut FftPlanner<f64>, inverse: bool) {
    for axis in [Axis(1), Axis(0)] {
        let len = data.len_of(axis);
        let fft = if inverse {
            planner.plan_fft_inverse(len)
        } else {
            planner.plan_fft_forward(len)
        };

        let mut buffer = vec![Complex64::new(0.0, 0.0); len];
        for mut lane in data.lanes_mut(axis) {
            for (slot, value) in buffer.iter_mut().zip(lane.iter()) {
                *slot = *value;
            }
            fft.process(&mut buffer);
            for (value, slot) in lane.iter_mut().zip(buffer.iter()) {
                *value = *slot;
            }
        }
    }
}
