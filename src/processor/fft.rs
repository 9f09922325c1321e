//! Windowed real FFT: Hann window, DC removal, magnitude spectrum.

use realfft::RealFftPlanner;
use std::sync::Arc;

/// Hann window of length `n`: `0.5 * (1 - cos(2*pi*i/(n-1)))`.
pub fn hann_window(n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| {
            let x = (2.0 * std::f64::consts::PI * i as f64) / (n as f64 - 1.0);
            (0.5 * (1.0 - x.cos())) as f32
        })
        .collect()
}

/// DC-removes (subtracts the mean of) a signal in place.
pub fn remove_dc(signal: &mut [f32]) {
    if signal.is_empty() {
        return;
    }
    let mean: f64 = signal.iter().map(|&v| v as f64).sum::<f64>() / signal.len() as f64;
    for v in signal.iter_mut() {
        *v -= mean as f32;
    }
}

/// Magnitude spectrum of one axis: DC-remove, Hann window, real FFT,
/// magnitude per bin for `k in [0, fft_n/2)`. If the input is shorter than
/// `fft_n` it is zero-padded on the right (ring has not yet filled).
pub fn axis_spectrum(samples: &[f32], fft_n: usize, window: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return vec![0.0; fft_n / 2];
    }
    let mut buf = vec![0.0f32; fft_n];
    let take = samples.len().min(fft_n);
    buf[fft_n - take..].copy_from_slice(&samples[samples.len() - take..]);
    remove_dc(&mut buf[fft_n - take..]);

    for (s, w) in buf.iter_mut().zip(window.iter()) {
        *s *= w;
    }

    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(fft_n);
    let mut spectrum = fft.make_output_vec();
    let mut input = buf;
    fft.process(&mut input, &mut spectrum).expect("input/output buffers sized by this planner");

    spectrum[..fft_n / 2].iter().map(|c| (c.norm_sqr()).sqrt()).collect()
}

/// Shared, reusable Hann-window cache keyed by `fft_n` (construction is not
/// free; the processor reuses one per tick).
#[derive(Clone)]
pub struct WindowCache {
    n: usize,
    window: Arc<Vec<f32>>,
}

impl WindowCache {
    pub fn new(n: usize) -> Self {
        Self { n, window: Arc::new(hann_window(n)) }
    }

    pub fn get(&self) -> &[f32] {
        &self.window
    }

    pub fn len(&self) -> usize {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hann_window_endpoints_are_zero() {
        let w = hann_window(8);
        assert!(w[0].abs() < 1e-6);
        assert!(w[w.len() - 1].abs() < 1e-6);
    }

    #[test]
    fn remove_dc_zeroes_the_mean() {
        let mut v = vec![1.0, 2.0, 3.0, 4.0];
        remove_dc(&mut v);
        let mean: f32 = v.iter().sum::<f32>() / v.len() as f32;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn known_sinusoid_peaks_near_expected_bin() {
        let fft_n = 2048;
        let sample_rate = 800.0;
        let freq = 25.0;
        let samples: Vec<f32> = (0..fft_n)
            .map(|i| (0.04 * (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate).sin()) as f32)
            .collect();
        let window = hann_window(fft_n);
        let spectrum = axis_spectrum(&samples, fft_n, &window);
        let expected_bin = (freq * fft_n as f64 / sample_rate).round() as usize;
        let (peak_bin, _) = spectrum.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()).unwrap();
        assert!((peak_bin as isize - expected_bin as isize).abs() <= 1, "peak_bin={peak_bin} expected={expected_bin}");
    }

    #[test]
    fn empty_input_gives_zero_spectrum() {
        let window = hann_window(16);
        let spectrum = axis_spectrum(&[], 16, &window);
        assert_eq!(spectrum.len(), 8);
        assert!(spectrum.iter().all(|&v| v == 0.0));
    }
}
