//! # Gpu — IBDWT Squaring Engine
//!
//! Owns every device buffer and composes the fixed kernel vocabulary into
//! the three primitives the outer loop needs: `mod_sq_loop` (n iterated
//! squarings mod M(E), optional trailing ×3), `mod_mul` (io ·= in), and
//! `data_residue`. On top of those sit the Gerbicz pieces: the parallel
//! check register, `check_and_update`, reconstruction of data from a loaded
//! check, and the good-state snapshots used for rollback.
//!
//! One in-order queue carries everything; kernel dependencies are encoded
//! purely by enqueue order. The only blocking points are buffer reads and
//! the explicit `finish` the outer loop uses as a timing barrier.
//!
//! Kernels see argument names, not positions, and arguments are sticky: the
//! constructor wires the stable ones once and the loop methods retouch only
//! the few that vary per call (`fftP.in`, `carryA.out`, `carryB.io`,
//! `transposeW.out`, `fftH.io`). `bufData` is both input and output of the
//! data loop; the kernels are written to tolerate top-level aliasing, never
//! aliasing within a single launch.

use anyhow::{ensure, Result};
use ocl::builders::KernelBuilder;
use ocl::prm::Double2;
use ocl::{Buffer, Kernel, MemFlags, OclPrm, Program, Queue};

use crate::cl::{cl_err, log_kernel_times, Kern};
use crate::prp::PrpEngine;
use crate::shape::{FftShape, GROUP_SIZE};
use crate::tables;
use crate::words;

pub struct Gpu {
    e: u32,
    shape: FftShape,
    queue: Queue,
    use_split_tail: bool,

    fft_p: Kern,
    fft_w: Kern,
    fft_h: Kern,
    carry_a: Kern,
    carry_m: Kern,
    carry_b: Kern,
    transpose_w: Kern,
    transpose_h: Kern,
    square: Kern,
    multiply: Kern,
    tail_fused: Kern,
    read_residue: Kern,
    do_check: Kern,
    compare: Kern,

    buf_data: Buffer<i32>,
    buf_check: Buffer<i32>,
    buf_check2: Buffer<i32>,
    buf_good_data: Buffer<i32>,
    buf_good_check: Buffer<i32>,
    buf_small_out: Buffer<i32>,

    buf2: Buffer<f64>,
    buf3: Buffer<f64>,

    // Referenced only through kernel arguments; held so they outlive the
    // kernels that name them.
    _buf1: Buffer<f64>,
    _buf_carry: Buffer<f64>,
    _buf_a: Buffer<f64>,
    _buf_i: Buffer<f64>,
    _buf_trig_w: Buffer<Double2>,
    _buf_trig_h: Buffer<Double2>,
    _buf_trans_trig: Buffer<Double2>,
    _buf_square_trig: Buffer<Double2>,
}

fn rw_buf<T: OclPrm>(queue: &Queue, len: usize) -> Result<Buffer<T>> {
    Buffer::<T>::builder()
        .queue(queue.clone())
        .len(len)
        .build()
        .map_err(cl_err)
}

fn device_buf<T: OclPrm>(queue: &Queue, len: usize) -> Result<Buffer<T>> {
    Buffer::<T>::builder()
        .queue(queue.clone())
        .flags(MemFlags::new().read_write().host_no_access())
        .len(len)
        .build()
        .map_err(cl_err)
}

fn const_buf<T: OclPrm>(queue: &Queue, data: &[T]) -> Result<Buffer<T>> {
    Buffer::<T>::builder()
        .queue(queue.clone())
        .flags(MemFlags::new().read_only().host_no_access())
        .len(data.len())
        .copy_host_slice(data)
        .build()
        .map_err(cl_err)
}

fn build_kern<'a>(
    program: &'a Program,
    queue: &Queue,
    name: &'static str,
    global: usize,
    local: usize,
    timed: bool,
    args: impl FnOnce(&mut KernelBuilder<'a>),
) -> Result<Kern> {
    let mut builder = Kernel::builder();
    builder
        .program(program)
        .name(name)
        .queue(queue.clone())
        .global_work_size(global)
        .local_work_size(local);
    args(&mut builder);
    Ok(Kern::new(name, builder.build().map_err(cl_err)?, timed))
}

fn set_buf<T: OclPrm>(kern: &Kern, name: &'static str, buf: &Buffer<T>) -> Result<()> {
    kern.kernel().set_arg(name, buf).map_err(cl_err)
}

impl Gpu {
    pub fn new(
        e: u32,
        shape: FftShape,
        program: &Program,
        queue: Queue,
        time_kernels: bool,
        use_split_tail: bool,
    ) -> Result<Gpu> {
        let n = shape.n();
        let hn = shape.half_n();
        let (w, h) = (shape.width, shape.height);
        let (nw, nh) = (shape.n_w(), shape.n_h());

        let weights = tables::weights(&shape, e);
        let buf_a = const_buf(&queue, &weights.forward)?;
        let buf_i = const_buf(&queue, &weights.inverse)?;
        let buf_trig_w = const_buf(&queue, &tables::small_trig(w, nw))?;
        let buf_trig_h = const_buf(&queue, &tables::small_trig(h, nh))?;
        let buf_trans_trig = const_buf(&queue, &tables::trans_trig(w, h))?;
        let buf_square_trig = const_buf(&queue, &tables::square_trig(w, h))?;

        let buf_data = rw_buf::<i32>(&queue, n)?;
        let buf_check = rw_buf::<i32>(&queue, n)?;
        let buf_check2 = device_buf::<i32>(&queue, n)?;
        let buf_good_data = device_buf::<i32>(&queue, n)?;
        let buf_good_check = device_buf::<i32>(&queue, n)?;
        let buf_small_out = rw_buf::<i32>(&queue, 256)?;

        let buf1 = device_buf::<f64>(&queue, n)?;
        let buf2 = device_buf::<f64>(&queue, n)?;
        let buf3 = device_buf::<f64>(&queue, n)?;
        let buf_carry = device_buf::<f64>(&queue, n)?;

        let transpose_size = (w / 64) * (h / 64) * 256;

        let fft_p = build_kern(program, &queue, "fftP", hn / nw, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("in", &buf_data)
                .arg_named("out", &buf1)
                .arg_named("A", &buf_a)
                .arg_named("smallTrig", &buf_trig_w);
        })?;
        let fft_w = build_kern(program, &queue, "fftW", hn / nw, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("io", &buf1).arg_named("smallTrig", &buf_trig_w);
        })?;
        let fft_h = build_kern(program, &queue, "fftH", hn / nh, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("io", &buf2).arg_named("smallTrig", &buf_trig_h);
        })?;
        let carry_a = build_kern(program, &queue, "carryA", hn / 16, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("in", &buf1)
                .arg_named("out", &buf_data)
                .arg_named("carryOut", &buf_carry)
                .arg_named("A", &buf_i);
        })?;
        let carry_m = build_kern(program, &queue, "carryM", hn / 16, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("in", &buf1)
                .arg_named("out", &buf_data)
                .arg_named("carryOut", &buf_carry)
                .arg_named("A", &buf_i);
        })?;
        let carry_b = build_kern(program, &queue, "carryB", hn / 16, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("io", &buf_data).arg_named("carryIn", &buf_carry);
        })?;
        let transpose_w = build_kern(
            program,
            &queue,
            "transposeW",
            transpose_size,
            GROUP_SIZE,
            time_kernels,
            |b| {
                b.arg_named("in", &buf1)
                    .arg_named("out", &buf2)
                    .arg_named("trig", &buf_trans_trig);
            },
        )?;
        let transpose_h = build_kern(
            program,
            &queue,
            "transposeH",
            transpose_size,
            GROUP_SIZE,
            time_kernels,
            |b| {
                b.arg_named("in", &buf2)
                    .arg_named("out", &buf1)
                    .arg_named("trig", &buf_trans_trig);
            },
        )?;
        let square = build_kern(program, &queue, "square", hn / 2, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("io", &buf2).arg_named("bigTrig", &buf_square_trig);
        })?;
        let multiply = build_kern(program, &queue, "multiply", hn / 2, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("io", &buf2)
                .arg_named("in", &buf3)
                .arg_named("bigTrig", &buf_square_trig);
        })?;
        let tail_fused = build_kern(
            program,
            &queue,
            "tailFused",
            hn / (2 * nh),
            GROUP_SIZE,
            time_kernels,
            |b| {
                b.arg_named("io", &buf2)
                    .arg_named("smallTrig", &buf_trig_h)
                    .arg_named("bigTrig", &buf_square_trig);
            },
        )?;
        let read_residue = build_kern(program, &queue, "readResidue", 64, 64, time_kernels, |b| {
            b.arg_named("in", &buf_data)
                .arg_named("out", &buf_small_out)
                .arg_named("start", 0i32);
        })?;
        let do_check = build_kern(program, &queue, "doCheck", hn / nw, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("in1", &buf_check)
                .arg_named("in2", &buf_check2)
                .arg_named("out", &buf_small_out);
        })?;
        let compare = build_kern(program, &queue, "compare", hn / 16, GROUP_SIZE, time_kernels, |b| {
            b.arg_named("in1", &buf_check)
                .arg_named("in2", &buf_check2)
                .arg_named("offset", 0u32)
                .arg_named("out", &buf_small_out);
        })?;

        Ok(Gpu {
            e,
            shape,
            queue,
            use_split_tail,
            fft_p,
            fft_w,
            fft_h,
            carry_a,
            carry_m,
            carry_b,
            transpose_w,
            transpose_h,
            square,
            multiply,
            tail_fused,
            read_residue,
            do_check,
            compare,
            buf_data,
            buf_check,
            buf_check2,
            buf_good_data,
            buf_good_check,
            buf_small_out,
            buf2,
            buf3,
            _buf1: buf1,
            _buf_carry: buf_carry,
            _buf_a: buf_a,
            _buf_i: buf_i,
            _buf_trig_w: buf_trig_w,
            _buf_trig_h: buf_trig_h,
            _buf_trans_trig: buf_trans_trig,
            _buf_square_trig: buf_square_trig,
        })
    }

    /// Upload a compact check register and rebuild data from it.
    fn upload_state(&self, check: &[u32], block_size: u32) -> Result<()> {
        let (w, h) = (self.shape.width, self.shape.height);
        let balanced = words::expand_bits(check, true, w, h, self.e);
        self.buf_check.write(&balanced[..]).enq().map_err(cl_err)?;
        self.data_from_check(block_size)
    }

    fn roundtrip_read(&self, buf: &Buffer<i32>) -> Result<Vec<u32>> {
        let mut raw = vec![0i32; self.shape.n()];
        buf.read(&mut raw).enq().map_err(cl_err)?;
        // Re-upload the exact bytes: the device state survives the host
        // round-trip unchanged.
        buf.write(&raw[..]).enq().map_err(cl_err)?;
        Ok(words::compact_bits(
            &raw,
            self.shape.width,
            self.shape.height,
            self.e,
        ))
    }

    fn residue_of_data(&self) -> Result<u64> {
        self.read_residue
            .kernel()
            .set_arg("start", 0i32)
            .map_err(cl_err)?;
        self.read_residue.run()?;
        let mut raw = vec![0i32; 128];
        self.buf_small_out
            .read(&mut raw)
            .len(128)
            .enq()
            .map_err(cl_err)?;
        Ok(words::residue_from_raw(self.shape.n(), self.e, &raw))
    }

    fn read_flags(&self) -> Result<(bool, bool)> {
        let mut out = vec![0i32; 2];
        self.buf_small_out
            .read(&mut out)
            .len(2)
            .enq()
            .map_err(cl_err)?;
        Ok((out[0] != 0, out[1] != 0))
    }

    fn copy(&self, src: &Buffer<i32>, dst: &Buffer<i32>) -> Result<()> {
        src.copy(dst, None, None).enq().map_err(cl_err)
    }

    /// The IBDWT convolution squaring loop on `in` into `out`, `n_iters`
    /// times, with an optional multiply-by-3 folded into the last carry.
    fn mod_sq_loop(
        &self,
        in_buf: &Buffer<i32>,
        out: &Buffer<i32>,
        n_iters: u32,
        mul3: bool,
    ) -> Result<()> {
        ensure!(n_iters > 0, "empty squaring loop");
        self.entry_kerns(in_buf)?;

        // Carry args needed for the core iterations.
        set_buf(&self.carry_a, "out", out)?;
        set_buf(&self.carry_b, "io", out)?;
        set_buf(&self.fft_p, "in", out)?;

        for _ in 0..n_iters - 1 {
            self.core_kerns()?;
        }
        self.exit_kerns(out, mul3)
    }

    /// The modular multiplication io ·= in.
    fn mod_mul(&self, in_buf: &Buffer<i32>, io: &Buffer<i32>, mul3: bool) -> Result<()> {
        self.direct_fft(in_buf, &self.buf3)?;
        self.direct_fft(io, &self.buf2)?;
        self.multiply.run()?; // buf2 ← buf2 · buf3
        self.fft_h.run()?;
        self.transpose_h.run()?;
        self.exit_kerns(io, mul3)
    }

    /// Rebuild the data register from check via the Gerbicz-Li relation:
    /// data = check^(2^blockSize − 1) · 3.
    fn data_from_check(&self, block_size: u32) -> Result<()> {
        ensure!(block_size >= 2, "block size {block_size} too small");
        self.mod_sq_loop(&self.buf_check, &self.buf_data, 1, false)?;
        for _ in 0..block_size - 2 {
            self.mod_mul(&self.buf_check, &self.buf_data, false)?;
            self.mod_sq_loop(&self.buf_data, &self.buf_data, 1, false)?;
        }
        self.mod_mul(&self.buf_check, &self.buf_data, true)
    }

    fn carry(&self) -> Result<()> {
        self.fft_w.run()?;
        self.carry_a.run()?;
        self.carry_b.run()?;
        self.fft_p.run()
    }

    fn tail(&self) -> Result<()> {
        if self.use_split_tail {
            self.fft_h.run()?;
            self.square.run()?;
            self.fft_h.run()
        } else {
            self.tail_fused.run()
        }
    }

    fn entry_kerns(&self, in_buf: &Buffer<i32>) -> Result<()> {
        set_buf(&self.fft_p, "in", in_buf)?;
        self.fft_p.run()?;
        self.transpose_w.run()?;
        self.tail()?;
        self.transpose_h.run()
    }

    fn core_kerns(&self) -> Result<()> {
        self.carry()?;
        self.transpose_w.run()?;
        self.tail()?;
        self.transpose_h.run()
    }

    fn exit_kerns(&self, out: &Buffer<i32>, mul3: bool) -> Result<()> {
        let carry_out = if mul3 { &self.carry_m } else { &self.carry_a };
        set_buf(carry_out, "out", out)?;
        set_buf(&self.carry_b, "io", out)?;

        self.fft_w.run()?;
        carry_out.run()?;
        self.carry_b.run()
    }

    fn direct_fft(&self, in_buf: &Buffer<i32>, out: &Buffer<f64>) -> Result<()> {
        set_buf(&self.fft_p, "in", in_buf)?;
        set_buf(&self.transpose_w, "out", out)?;
        set_buf(&self.fft_h, "io", out)?;

        self.fft_p.run()?;
        self.transpose_w.run()?;
        self.fft_h.run()
    }
}

impl PrpEngine for Gpu {
    fn write_state(&mut self, check: &[u32], block_size: u32) -> Result<()> {
        self.upload_state(check, block_size)
    }

    fn data_loop(&mut self, reps: u32) -> Result<()> {
        self.mod_sq_loop(&self.buf_data, &self.buf_data, reps, false)
    }

    fn update_check(&mut self) -> Result<()> {
        self.mod_mul(&self.buf_data, &self.buf_check, false)
    }

    /// The Gerbicz verification. Does not change data; updates check.
    fn check_and_update(&mut self, block_size: u32) -> Result<bool> {
        self.mod_sq_loop(&self.buf_check, &self.buf_check2, block_size, true)?;
        self.mod_mul(&self.buf_data, &self.buf_check, false)?;

        self.compare.run()?;
        let (equal1, not_zero1) = self.read_flags()?;
        self.do_check.run()?;
        let (equal2, not_zero2) = self.read_flags()?;
        Ok(equal1 && not_zero1 && equal2 && not_zero2)
    }

    fn data_residue(&mut self) -> Result<u64> {
        self.residue_of_data()
    }

    fn roundtrip_data(&mut self) -> Result<Vec<u32>> {
        self.roundtrip_read(&self.buf_data)
    }

    fn roundtrip_check(&mut self) -> Result<Vec<u32>> {
        self.roundtrip_read(&self.buf_check)
    }

    fn save_good(&mut self) -> Result<()> {
        self.copy(&self.buf_data, &self.buf_good_data)?;
        self.copy(&self.buf_check, &self.buf_good_check)
    }

    fn revert_good(&mut self) -> Result<()> {
        self.copy(&self.buf_good_data, &self.buf_data)?;
        self.copy(&self.buf_good_check, &self.buf_check)
    }

    fn finish(&mut self) -> Result<()> {
        self.queue.finish().map_err(cl_err)
    }

    fn log_time_kernels(&mut self) {
        let mut entries = [
            &self.fft_p,
            &self.fft_w,
            &self.fft_h,
            &self.carry_a,
            &self.carry_m,
            &self.carry_b,
            &self.transpose_w,
            &self.transpose_h,
            &self.square,
            &self.multiply,
            &self.tail_fused,
        ]
        .map(|k| (k.name(), k.take_stats()));
        log_kernel_times(&mut entries);
    }
}
