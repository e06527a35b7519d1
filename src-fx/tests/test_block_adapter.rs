// Integration tests for the block adaptation protocol

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtfx::BlockAdapter;
use rtfx::util::gcd;

/// Push `input` through an identity algorithm in host blocks of the given sizes
fn run_schedule(adapter: &mut BlockAdapter, input: &[f32], sizes: &[usize]) -> (Vec<f32>, Vec<usize>) {
    let mut output = Vec::with_capacity(input.len());
    let mut latencies = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for &n in sizes {
        let mut left = input[offset..offset + n].to_vec();
        let mut right: Vec<f32> = left.iter().map(|v| -v).collect();
        adapter.process(&mut left, &mut right, None, |_| {});
        for (l, r) in left.iter().zip(&right) {
            assert_eq!(*l, -*r);
        }
        output.extend(left);
        latencies.push(adapter.latency_frames());
        offset += n;
    }
    (output, latencies)
}

fn ramp(len: usize) -> Vec<f32> {
    (1..=len).map(|i| i as f32).collect()
}

#[test]
fn test_constant_periods_delay_by_fixed_latency() {
    for blocksize in [128, 256, 441, 1024] {
        for period in [64, 100, 256, 480, 1000] {
            let blocks = 40;
            let input = ramp(period * blocks);
            let mut adapter = BlockAdapter::new(blocksize, 1024, false);
            let (output, latencies) = run_schedule(&mut adapter, &input, &vec![period; blocks]);

            let expected = blocksize - gcd(period, blocksize);
            assert!(
                latencies.iter().all(|&l| l == expected),
                "B={blocksize} N={period}: latency {:?}, expected {expected}",
                latencies.iter().max()
            );
            assert_eq!(output.len(), input.len());
            assert!(output[..expected].iter().all(|&s| s == 0.0));
            assert_eq!(&output[expected..], &input[..input.len() - expected]);
        }
    }
}

#[test]
fn test_varying_schedule_keeps_every_sample_in_order() {
    let mut rng = StdRng::seed_from_u64(42);
    for blocksize in [64, 240, 512] {
        let sizes: Vec<usize> = (0..200).map(|_| rng.random_range(1..=700)).collect();
        let total: usize = sizes.iter().sum();
        let input = ramp(total);

        let mut adapter = BlockAdapter::new(blocksize, 1024, false);
        let (output, latencies) = run_schedule(&mut adapter, &input, &sizes);

        assert_eq!(output.len(), input.len());
        // latency only ever grows, by the synthetic zeros written
        assert!(latencies.windows(2).all(|w| w[0] <= w[1]));
        let zeros = output.iter().filter(|&&s| s == 0.0).count();
        assert_eq!(zeros, adapter.latency_frames());

        let audio: Vec<f32> = output.into_iter().filter(|&s| s != 0.0).collect();
        assert_eq!(&audio[..], &input[..audio.len()]);
    }
}

#[test]
fn test_schedule_sharing_the_first_gcd_never_underruns() {
    // every period is a multiple of gcd(first period, B), so the priming
    // fill covers the worst case and the latency never moves
    let blocksize = 480;
    let first = 96;
    let g = gcd(first, blocksize);
    let mut rng = StdRng::seed_from_u64(3);
    let mut sizes = vec![first];
    sizes.extend((0..300).map(|_| g * rng.random_range(1..=10)));
    let input = ramp(sizes.iter().sum());

    let mut adapter = BlockAdapter::new(blocksize, 1024, false);
    let (output, latencies) = run_schedule(&mut adapter, &input, &sizes);

    let expected = blocksize - g;
    assert!(latencies.iter().all(|&l| l == expected));
    assert_eq!(&output[expected..], &input[..input.len() - expected]);
}
