//! Shuffle buffer decoupling transformer forward passes from SAE steps
//!
//! A fixed pool of `buffer_size` activation vectors stored at F16. The first
//! refresh fills the whole pool; later refreshes only refill the front
//! `refresh_ratio` fraction (the region consumed since the previous refresh)
//! and then re-permute the *entire* pool so stale and fresh rows mix.
//!
//! ```text
//! refresh:  [ fresh rows ......... | retained tail ............ ]  -> permute all
//! next:     serve [p, p + batch) ; p += batch
//!           next call refreshes first once p > floor(cap * ratio) - batch
//! ```
//!
//! Refresh is synchronous and happens at the start of the `next()` call that
//! follows the low-water crossing, so that call is the latency spike.

use std::time::{Duration, Instant};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::SaeConfig;
use crate::corpus::TokenCorpus;
use crate::source::{flatten_checked, ActivationSource};

/// Storage precision for buffered activations.
pub const BUFFER_DTYPE: DType = DType::F16;

pub struct ShuffleBuffer<S: ActivationSource> {
    /// (buffer_size, act_size) at [`BUFFER_DTYPE`]
    buffer: Tensor,
    read_pointer: usize,
    first: bool,
    corpus: TokenCorpus,
    source: S,
    cfg: SaeConfig,
    device: Device,
    rng: rand::rngs::StdRng,
    /// `floor(capacity * refresh_ratio) - batch_size`
    low_water_mark: usize,
    refresh_count: usize,
    time_refreshing: Duration,
}

impl<S: ActivationSource> ShuffleBuffer<S> {
    /// Allocate the pool and run the first (full) refresh.
    ///
    /// `cfg` must already be derived. The corpus sequence length has to match
    /// `cfg.seq_len`.
    pub fn new(cfg: &SaeConfig, corpus: TokenCorpus, source: S, device: &Device) -> Result<Self> {
        anyhow::ensure!(
            cfg.buffer_size > 0 && cfg.act_size > 0,
            "Config must be derived before building a buffer"
        );
        anyhow::ensure!(
            corpus.seq_len() == cfg.seq_len,
            "Corpus sequence length {} does not match config seq_len {}",
            corpus.seq_len(),
            cfg.seq_len
        );
        let corpus = corpus.with_policy(cfg.corpus_policy);
        let buffer = Tensor::zeros((cfg.buffer_size, cfg.act_size), BUFFER_DTYPE, device)?;
        let refresh_rows = (cfg.buffer_size as f64 * cfg.buffer_refresh_ratio).floor() as usize;
        let low_water_mark = refresh_rows.saturating_sub(cfg.batch_size);

        info!(
            "Shuffle buffer: {} x {} ({:.1} MB), refresh ratio {}, source: {}",
            cfg.buffer_size,
            cfg.act_size,
            (cfg.buffer_size * cfg.act_size * BUFFER_DTYPE.size_in_bytes()) as f64 / 1e6,
            cfg.buffer_refresh_ratio,
            source.describe()
        );

        let mut buf = Self {
            buffer,
            read_pointer: 0,
            first: true,
            corpus,
            source,
            cfg: cfg.clone(),
            device: device.clone(),
            rng: rand::rngs::StdRng::seed_from_u64(cfg.seed),
            low_water_mark,
            refresh_count: 0,
            time_refreshing: Duration::ZERO,
        };
        buf.refresh()?;
        Ok(buf)
    }

    /// Token sequences fetched by the upcoming refresh.
    fn sequences_to_fetch(&self) -> usize {
        if self.first {
            self.cfg.buffer_batches
        } else {
            (self.cfg.buffer_batches as f64 * self.cfg.buffer_refresh_ratio).floor() as usize
        }
    }

    /// Pull fresh activations into the front of the pool and re-permute it.
    ///
    /// On any error (width mismatch, exhausted corpus, source failure) the
    /// pool, read pointer and token cursor are left exactly as they were.
    pub fn refresh(&mut self) -> Result<()> {
        let t0 = Instant::now();
        let n_sequences = self.sequences_to_fetch();
        let mbs = self.cfg.model_batch_size();
        let n_chunks = n_sequences.div_ceil(mbs);

        // Stage everything before touching state
        let mut corpus = self.corpus.clone();
        let mut staged: Vec<Tensor> = Vec::with_capacity(n_chunks);
        let mut n_rows = 0usize;
        for _ in 0..n_chunks {
            let tokens = corpus.next_chunk(mbs)?.to_device(&self.device)?;
            let acts = self.source.forward(&tokens)?;
            let flat = flatten_checked(&acts, self.cfg.flatten_heads, self.cfg.act_size)?;
            n_rows += flat.dim(0)?;
            anyhow::ensure!(
                n_rows <= self.cfg.buffer_size,
                "Refresh produced {n_rows} rows, more than buffer capacity {}",
                self.cfg.buffer_size
            );
            staged.push(flat.to_dtype(BUFFER_DTYPE)?);
        }

        let mut parts = staged;
        if n_rows < self.cfg.buffer_size {
            parts.push(
                self.buffer
                    .narrow(0, n_rows, self.cfg.buffer_size - n_rows)?,
            );
        }
        let combined = Tensor::cat(&parts, 0)?;

        let mut perm: Vec<u32> = (0..self.cfg.buffer_size as u32).collect();
        perm.shuffle(&mut self.rng);
        let perm = Tensor::from_vec(perm, self.cfg.buffer_size, &self.device)?;
        let shuffled = combined.index_select(&perm, 0)?;

        // Commit
        self.buffer = shuffled;
        self.corpus = corpus;
        self.read_pointer = 0;
        self.first = false;
        self.refresh_count += 1;
        let elapsed = t0.elapsed();
        self.time_refreshing += elapsed;
        debug!(
            "Buffer refresh #{}: {n_rows} fresh rows from {n_sequences} sequences in {:.2?} (token pointer {})",
            self.refresh_count,
            elapsed,
            self.corpus.token_pointer()
        );
        Ok(())
    }

    /// Whether the next `next()` call will refresh first.
    pub fn needs_refresh(&self) -> bool {
        self.read_pointer > self.low_water_mark
    }

    /// Serve the next `batch_size` rows, converted to `dtype`.
    ///
    /// If the previous call pushed the read pointer past the low-water mark,
    /// the pool is refreshed before serving.
    pub fn next_as(&mut self, dtype: DType) -> Result<Tensor> {
        if self.needs_refresh() {
            self.refresh()?;
        }
        let out = self
            .buffer
            .narrow(0, self.read_pointer, self.cfg.batch_size)?
            .to_dtype(dtype)?;
        self.read_pointer += self.cfg.batch_size;
        Ok(out)
    }

    /// Serve the next batch at the autoencoder's configured precision.
    pub fn next(&mut self) -> Result<Tensor> {
        self.next_as(self.cfg.enc_dtype.dtype())
    }

    /// Mix a freshly built pool before training by forcing extra refreshes.
    ///
    /// With `half_first`, half of the pool is first treated as consumed and
    /// refreshed; then `1 + floor(fresh_factor / refresh_ratio)` regular
    /// partial refreshes follow.
    pub fn freshen(&mut self, fresh_factor: f64, half_first: bool) -> Result<()> {
        if half_first {
            self.refresh()?;
        }
        let rounds = 1 + (fresh_factor / self.cfg.buffer_refresh_ratio).floor() as usize;
        for _ in 0..rounds {
            self.refresh()?;
        }
        info!(
            "Buffer freshened with {} refreshes (token pointer {})",
            rounds + usize::from(half_first),
            self.corpus.token_pointer()
        );
        Ok(())
    }

    pub fn read_pointer(&self) -> usize {
        self.read_pointer
    }

    pub fn capacity(&self) -> usize {
        self.cfg.buffer_size
    }

    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count
    }

    /// Cumulative wall time spent in `refresh`.
    pub fn time_refreshing(&self) -> Duration {
        self.time_refreshing
    }

    pub fn token_pointer(&self) -> usize {
        self.corpus.token_pointer()
    }

    /// The whole pool as f32 rows, in storage order.
    pub fn contents(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.buffer.to_dtype(DType::F32)?.to_vec2()?)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cfg(&self) -> &SaeConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SaeError;

    /// Emits rows `[c, -c]` for a running counter `c`, so every row is unique
    /// and exactly representable at F16.
    struct CountingSource {
        next: f32,
        width: usize,
        calls: usize,
    }

    impl ActivationSource for CountingSource {
        fn forward(&mut self, tokens: &Tensor) -> Result<Tensor> {
            let (b, p) = tokens.dims2()?;
            let mut data = Vec::with_capacity(b * p * self.width);
            for _ in 0..b * p {
                data.push(self.next);
                for _ in 1..self.width {
                    data.push(-self.next);
                }
                self.next += 1.0;
            }
            self.calls += 1;
            Ok(Tensor::from_vec(data, (b, p, self.width), tokens.device())?)
        }
    }

    fn cfg() -> SaeConfig {
        SaeConfig {
            batch_size: 4,
            buffer_mult: 16,
            seq_len: 4,
            flatten_heads: false,
            d_head: 2,
            dict_mult: 2,
            buffer_refresh_ratio: 0.5,
            model_batch_size: Some(2),
            ..Default::default()
        }
        .derive()
        .unwrap()
    }

    fn corpus(n: usize) -> TokenCorpus {
        let flat: Vec<u32> = vec![0; n * 4];
        TokenCorpus::from_flat(&flat, 4).unwrap()
    }

    fn buffer(n_seqs: usize) -> ShuffleBuffer<CountingSource> {
        let src = CountingSource {
            next: 0.0,
            width: 2,
            calls: 0,
        };
        ShuffleBuffer::new(&cfg(), corpus(n_seqs), src, &Device::Cpu).unwrap()
    }

    fn sorted_keys(rows: &[Vec<f32>]) -> Vec<i64> {
        let mut keys: Vec<i64> = rows.iter().map(|r| r[0] as i64).collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_first_refresh_fills_everything() {
        let buf = buffer(64);
        // 16 sequences in chunks of 2 -> 8 forward calls, 64 rows
        assert_eq!(buf.source().calls, 8);
        assert_eq!(buf.token_pointer(), 16);
        assert_eq!(buf.read_pointer(), 0);
        let keys = sorted_keys(&buf.contents().unwrap());
        assert_eq!(keys, (0..64).collect::<Vec<i64>>());
    }

    #[test]
    fn test_pointer_invariant_and_trigger() {
        let mut buf = buffer(64);
        assert_eq!(buf.low_water_mark(), 28);
        for call in 1..=8 {
            let before = buf.read_pointer();
            assert!(!buf.needs_refresh());
            let batch = buf.next().unwrap();
            assert_eq!(batch.dims(), &[4, 2]);
            assert_eq!(buf.read_pointer(), before + 4, "call {call}");
        }
        // 32 > 28: the following call refreshes first
        assert!(buf.needs_refresh());
        assert_eq!(buf.refresh_count(), 1);
        buf.next().unwrap();
        assert_eq!(buf.refresh_count(), 2);
        assert_eq!(buf.read_pointer(), 4);
        // partial refresh: floor(16 * 0.5) = 8 sequences
        assert_eq!(buf.token_pointer(), 24);
    }

    #[test]
    fn test_refresh_is_a_permutation_of_fresh_plus_tail() {
        let mut buf = buffer(64);
        while !buf.needs_refresh() {
            buf.next().unwrap();
        }
        let before = buf.contents().unwrap();
        buf.refresh().unwrap();
        let after = buf.contents().unwrap();

        // 32 fresh rows overwrite the front, rows [32, 64) are retained
        let mut expected: Vec<i64> = before[32..].iter().map(|r| r[0] as i64).collect();
        expected.extend(64..96);
        expected.sort_unstable();
        assert_eq!(sorted_keys(&after), expected);
        assert_eq!(buf.read_pointer(), 0);
        // Rows keep their internal layout
        assert!(after.iter().all(|r| r[1] == -r[0]));
    }

    #[test]
    fn test_width_mismatch_leaves_state_unmodified() {
        let mut buf = buffer(64);
        buf.next().unwrap();
        let before = buf.contents().unwrap();
        let pointer = buf.read_pointer();
        let tokens = buf.token_pointer();

        buf.source.width = 3;
        let err = buf.refresh().unwrap_err();
        assert_eq!(
            err.downcast_ref::<SaeError>(),
            Some(&SaeError::WidthMismatch {
                expected: 2,
                actual: 3
            })
        );
        assert_eq!(buf.contents().unwrap(), before);
        assert_eq!(buf.read_pointer(), pointer);
        assert_eq!(buf.token_pointer(), tokens);
    }

    #[test]
    fn test_corpus_exhaustion_is_explicit() {
        // 16 sequences for the first fill, only 4 left for the partial refresh
        let mut buf = buffer(20);
        let err = buf.refresh().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SaeError>(),
            Some(SaeError::CorpusExhausted { .. })
        ));
        assert_eq!(buf.token_pointer(), 16);
    }

    #[test]
    fn test_freshen_counts_refreshes() {
        let mut buf = buffer(200);
        buf.freshen(0.5, true).unwrap();
        // initial + half_first + (1 + floor(0.5 / 0.5))
        assert_eq!(buf.refresh_count(), 4);
        assert_eq!(buf.read_pointer(), 0);
    }

    #[test]
    fn test_timing_accumulates() {
        let mut buf = buffer(64);
        let t1 = buf.time_refreshing();
        buf.refresh().unwrap();
        assert!(buf.time_refreshing() >= t1);
    }
}
