//! Per-voxel arithmetic over whole datasets.
//!
//! An [`ExpressionEvaluator`] parses one infix expression (`+ - * /`,
//! parentheses, unary minus, floating literals, and the placeholders `A`
//! through `Z` naming the first through twenty-sixth input volume) and
//! evaluates it brick by brick in lock step over all inputs, producing a
//! new container. Every evaluator call is self-contained; nothing is
//! shared between calls.

use crate::accel::{self, DEFAULT_HISTOGRAM_BUCKETS};
use crate::container::{RasterMetadata, RasterOutputBlock, VolumeDataset};
use crate::dispatch_kind;
use crate::error::{ConvertError, Result};
use crate::numeric::{NumericKind, Sample};
use crate::rawconv::{remove_best_effort, unique_temp_path};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Constant(f64),
    Volume(usize),
    Negate(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

/// One parsed expression, ready to evaluate over a set of volumes.
pub struct ExpressionEvaluator {
    root: Expr,
    placeholder_count: usize,
}

impl ExpressionEvaluator {
    pub fn new(expression: &str) -> Result<Self> {
        let tokens = lex(expression)?;
        let mut parser = Parser { tokens, cursor: 0 };
        let root = parser.parse_expr()?;
        if parser.cursor != parser.tokens.len() {
            let (_, position) = parser.tokens[parser.cursor];
            return Err(ConvertError::Parse {
                position,
                message: "trailing input after expression".into(),
            });
        }
        let mut max_placeholder = None;
        collect_placeholders(&root, &mut max_placeholder);
        let Some(max) = max_placeholder else {
            return Err(ConvertError::Parse {
                position: 0,
                message: "expression references no volume".into(),
            });
        };
        Ok(ExpressionEvaluator { root, placeholder_count: max + 1 })
    }

    /// Number of volumes the expression references (the highest placeholder
    /// plus one).
    pub fn placeholder_count(&self) -> usize {
        self.placeholder_count
    }

    /// Evaluate over `volumes`, writing a new container at `target`. The
    /// inputs must share domain size and brick layout; the output carries
    /// the widest input kind. Data of an input with a narrower kind is
    /// rescaled from its value range into the output kind's range.
    pub fn evaluate(&self, volumes: &[PathBuf], target: &Path, temp_dir: &Path) -> Result<()> {
        if volumes.len() < self.placeholder_count {
            return Err(ConvertError::Incompatible(format!(
                "expression needs {} volumes, got {}",
                self.placeholder_count,
                volumes.len()
            )));
        }
        if volumes.len() > self.placeholder_count {
            log::warn!(
                "{} volume(s) beyond the last placeholder are ignored",
                volumes.len() - self.placeholder_count
            );
        }

        let mut inputs = Vec::with_capacity(self.placeholder_count);
        for path in &volumes[..self.placeholder_count] {
            inputs.push(VolumeDataset::open(path)?);
        }
        let out_kind = self.check_inputs(&mut inputs)?;

        let first_meta = inputs[0].metadata().clone();
        let out_meta = RasterMetadata::new(
            out_kind,
            1,
            first_meta.domain(),
            first_meta.aspect,
            first_meta.max_brick,
            first_meta.overlap,
        )?;

        // per-input rescale factors into the output kind's range
        let dest_max = dispatch_kind!(out_kind, T => { T::MAX_F64 })?;
        let mut rescales = Vec::with_capacity(inputs.len());
        for ds in &mut inputs {
            if ds.kind() == out_kind || out_kind.is_float() {
                rescales.push(None);
            } else {
                let (lo, hi) = ds.compute_range()?;
                rescales.push(Some((lo, if hi > lo { dest_max / (hi - lo) } else { 0.0 })));
            }
        }

        let temp = unique_temp_path(temp_dir, "expression", "raw");
        let mut output = RasterOutputBlock::create(out_meta, temp)?;
        let supported = eval_supported(out_kind);
        if !supported {
            log::error!("evaluation is not implemented for {out_kind} data");
        }

        for lod in 0..first_meta.lod_count() {
            for linear in 0..first_meta.brick_count_linear(lod) {
                if !supported {
                    log::error!("skipping brick ({lod},{linear}): {out_kind} unsupported");
                    continue;
                }
                let mut brick_values = Vec::with_capacity(inputs.len());
                for (ds, rescale) in inputs.iter_mut().zip(&rescales) {
                    let kind = ds.kind();
                    let bytes = ds.read_brick_bytes(lod, linear)?;
                    let mut values: Vec<f64> = dispatch_kind!(kind, T => {
                        bytemuck::cast_slice::<u8, T>(&bytes)
                            .iter()
                            .map(|v| v.to_f64())
                            .collect()
                    })?;
                    if let Some((lo, scale)) = rescale {
                        for v in &mut values {
                            *v = (*v - lo) * scale;
                        }
                    }
                    brick_values.push(values);
                }

                let result = eval(&self.root, &brick_values, brick_values[0].len());
                let bytes: Vec<u8> = dispatch_kind!(out_kind, T => {
                    let samples: Vec<T> = result.iter().map(|&v| T::from_f64(v)).collect();
                    bytemuck::cast_slice(&samples).to_vec()
                })?;
                output.write_brick(lod, linear, &bytes)?;
            }
        }

        let written = output
            .write_container(target)
            .and_then(|()| accel::attach_acceleration(target, DEFAULT_HISTOGRAM_BUCKETS));
        if written.is_err() {
            remove_best_effort(target);
        }
        written
    }

    /// Inputs must be scalar and share domain and brick layout; the output
    /// kind is the widest over all inputs.
    fn check_inputs(&self, inputs: &mut [VolumeDataset]) -> Result<NumericKind> {
        let mut out_kind = inputs[0].kind();
        let first = inputs[0].metadata().clone();
        for ds in inputs.iter() {
            if ds.components() != 1 {
                return Err(ConvertError::Incompatible(
                    "expressions operate on scalar volumes only".into(),
                ));
            }
            let meta = ds.metadata();
            if meta.timesteps != first.timesteps {
                return Err(ConvertError::Incompatible(
                    "input volumes disagree in timestep count".into(),
                ));
            }
            // compare the decoded pyramids directly, not just the
            // parameters they were derived from
            if meta.max_brick != first.max_brick
                || meta.overlap != first.overlap
                || meta.lods != first.lods
            {
                return Err(ConvertError::Incompatible(
                    "input volumes do not share a brick layout".into(),
                ));
            }
            out_kind = out_kind.widest(ds.kind());
        }
        Ok(out_kind)
    }
}

/// The kinds the per-brick evaluator is instantiated for.
fn eval_supported(kind: NumericKind) -> bool {
    !matches!(
        (kind.bit_width(), kind.is_float()),
        (64, _) | (32, false)
    )
}

fn collect_placeholders(expr: &Expr, max: &mut Option<usize>) {
    match expr {
        Expr::Constant(_) => {}
        Expr::Volume(i) => *max = Some(max.map_or(*i, |m: usize| m.max(*i))),
        Expr::Negate(a) => collect_placeholders(a, max),
        Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
            collect_placeholders(a, max);
            collect_placeholders(b, max);
        }
    }
}

fn eval(expr: &Expr, inputs: &[Vec<f64>], len: usize) -> Vec<f64> {
    match expr {
        Expr::Constant(c) => vec![*c; len],
        Expr::Volume(i) => inputs[*i].clone(),
        Expr::Negate(a) => {
            let mut out = eval(a, inputs, len);
            for v in &mut out {
                *v = -*v;
            }
            out
        }
        Expr::Add(a, b) => zip(eval(a, inputs, len), eval(b, inputs, len), |x, y| x + y),
        Expr::Sub(a, b) => zip(eval(a, inputs, len), eval(b, inputs, len), |x, y| x - y),
        Expr::Mul(a, b) => zip(eval(a, inputs, len), eval(b, inputs, len), |x, y| x * y),
        Expr::Div(a, b) => zip(eval(a, inputs, len), eval(b, inputs, len), |x, y| x / y),
    }
}

fn zip(mut a: Vec<f64>, b: Vec<f64>, op: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    for (x, y) in a.iter_mut().zip(b) {
        *x = op(*x, y);
    }
    a
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Volume(usize),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn lex(input: &str) -> Result<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let token = match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            'A'..='Z' => Token::Volume(c as usize - 'A' as usize),
            'a'..='z' => Token::Volume(c as usize - 'a' as usize),
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len() && matches!(bytes[i] as char, '0'..='9' | '.') {
                    i += 1;
                }
                let text = &input[start..i];
                let value = text.parse::<f64>().map_err(|_| ConvertError::Parse {
                    position: start,
                    message: format!("malformed number '{text}'"),
                })?;
                tokens.push((Token::Number(value), start));
                continue;
            }
            other => {
                return Err(ConvertError::Parse {
                    position: i,
                    message: format!("unexpected character '{other}'"),
                });
            }
        };
        tokens.push((token, i));
        i += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.cursor).map(|&(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .or_else(|| self.tokens.last())
            .map_or(0, |&(_, p)| p)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus | Token::Minus => {
                    self.cursor += 1;
                    let rhs = self.parse_term()?;
                    lhs = match op {
                        Token::Plus => Expr::Add(Box::new(lhs), Box::new(rhs)),
                        _ => Expr::Sub(Box::new(lhs), Box::new(rhs)),
                    };
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star | Token::Slash => {
                    self.cursor += 1;
                    let rhs = self.parse_factor()?;
                    lhs = match op {
                        Token::Star => Expr::Mul(Box::new(lhs), Box::new(rhs)),
                        _ => Expr::Div(Box::new(lhs), Box::new(rhs)),
                    };
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let position = self.position();
        match self.peek() {
            Some(Token::Minus) => {
                self.cursor += 1;
                Ok(Expr::Negate(Box::new(self.parse_factor()?)))
            }
            Some(Token::Number(v)) => {
                self.cursor += 1;
                Ok(Expr::Constant(v))
            }
            Some(Token::Volume(i)) => {
                self.cursor += 1;
                Ok(Expr::Volume(i))
            }
            Some(Token::LParen) => {
                self.cursor += 1;
                let inner = self.parse_expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.cursor += 1;
                        Ok(inner)
                    }
                    _ => Err(ConvertError::Parse {
                        position: self.position(),
                        message: "expected ')'".into(),
                    }),
                }
            }
            _ => Err(ConvertError::Parse {
                position,
                message: "expected a number, volume letter, or '('".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawconv::convert_raw_dataset;
    use crate::registry::{BrickingOptions, ElementSemantic, RawVolume};

    fn container_from<T: Sample>(dir: &Path, stem: &str, samples: &[T]) -> PathBuf {
        let raw = dir.join(format!("{stem}.raw"));
        crate::rawconv::write_raw_samples(&raw, samples).unwrap();
        let container = dir.join(format!("{stem}.bvf"));
        convert_raw_dataset(
            &RawVolume {
                path: raw,
                header_skip: 0,
                kind: T::KIND,
                components: 1,
                endian_mismatch: false,
                domain: [2, 2, 2],
                aspect: [1.0; 3],
                title: stem.into(),
                semantic: ElementSemantic::Undefined,
                owns_temp: false,
            },
            &container,
            dir,
            &BrickingOptions { max_brick: 8, overlap: 2, quantize_to_8bit: false, no_interaction: true },
        )
        .unwrap();
        container
    }

    #[test]
    fn sum_of_two_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u16> = (0..8).map(|i| i * 100).collect();
        let b: Vec<u16> = (0..8).map(|i| i + 1).collect();
        let vol_a = container_from(dir.path(), "a", &a);
        let vol_b = container_from(dir.path(), "b", &b);

        let target = dir.path().join("sum.bvf");
        ExpressionEvaluator::new("A + B")
            .unwrap()
            .evaluate(&[vol_a, vol_b], &target, dir.path())
            .unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        assert_eq!(ds.kind(), NumericKind::U16);
        let brick = ds.read_brick::<u16>(0, 0).unwrap();
        for (i, &v) in brick.iter().enumerate() {
            assert_eq!(v as usize, i * 100 + i + 1);
        }
    }

    #[test]
    fn precedence_and_unary_minus() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u16> = (0..8).map(|i| i * 10).collect();
        let vol_a = container_from(dir.path(), "a", &a);

        let target = dir.path().join("out.bvf");
        ExpressionEvaluator::new("2 * a + -(3 - 8)")
            .unwrap()
            .evaluate(&[vol_a], &target, dir.path())
            .unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        let brick = ds.read_brick::<u16>(0, 0).unwrap();
        for (i, &v) in brick.iter().enumerate() {
            assert_eq!(v as usize, 2 * i * 10 + 5);
        }
    }

    #[test]
    fn narrow_input_is_rescaled_into_the_wide_kind() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u8> = vec![0, 51, 102, 153, 204, 255, 0, 255];
        let b: Vec<u16> = vec![0; 8];
        let vol_a = container_from(dir.path(), "a", &a);
        let vol_b = container_from(dir.path(), "b", &b);

        let target = dir.path().join("wide.bvf");
        ExpressionEvaluator::new("A + B")
            .unwrap()
            .evaluate(&[vol_a, vol_b], &target, dir.path())
            .unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        assert_eq!(ds.kind(), NumericKind::U16);
        let brick = ds.read_brick::<u16>(0, 0).unwrap();
        // u8 range 0..=255 stretched over the full u16 range
        for (src, &v) in a.iter().zip(&brick) {
            let expect = (*src as f64 * 65535.0 / 255.0).round() as i64;
            assert!((v as i64 - expect).abs() <= 1, "got {v}, expected about {expect}");
        }
    }

    #[test]
    fn unsupported_output_kind_yields_empty_bricks() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u32> = (0..8).collect();
        let vol_a = container_from(dir.path(), "a", &a);

        let target = dir.path().join("skipped.bvf");
        ExpressionEvaluator::new("A * 2")
            .unwrap()
            .evaluate(&[vol_a], &target, dir.path())
            .unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        let brick = ds.read_brick::<u32>(0, 0).unwrap();
        assert!(brick.iter().all(|&v| v == 0));
    }

    #[test]
    fn mismatched_layouts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u8> = vec![0; 8];
        let vol_a = container_from(dir.path(), "a", &a);

        let raw = dir.path().join("b.raw");
        crate::rawconv::write_raw_samples(&raw, &[0u8; 27]).unwrap();
        let vol_b = dir.path().join("b.bvf");
        convert_raw_dataset(
            &RawVolume {
                path: raw,
                header_skip: 0,
                kind: NumericKind::U8,
                components: 1,
                endian_mismatch: false,
                domain: [3, 3, 3],
                aspect: [1.0; 3],
                title: "b".into(),
                semantic: ElementSemantic::Undefined,
                owns_temp: false,
            },
            &vol_b,
            dir.path(),
            &BrickingOptions { max_brick: 8, overlap: 2, quantize_to_8bit: false, no_interaction: true },
        )
        .unwrap();

        let err = ExpressionEvaluator::new("A - B")
            .unwrap()
            .evaluate(&[vol_a, vol_b], &dir.path().join("out.bvf"), dir.path())
            .unwrap_err();
        assert!(matches!(err, ConvertError::Incompatible(_)));
    }

    #[test]
    fn mismatched_timestep_counts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u8> = vec![0; 8];
        let vol_a = container_from(dir.path(), "a", &a);

        // same domain and brick parameters, but a second timestep recorded
        let mut meta =
            RasterMetadata::new(NumericKind::U8, 1, [2, 2, 2], [1.0; 3], 8, 2).unwrap();
        meta.timesteps = 2;
        let vol_b = dir.path().join("b.bvf");
        crate::container::write_raster_container(&vol_b, &meta, |_, _| Ok(vec![0u8; 8]))
            .unwrap();

        let err = ExpressionEvaluator::new("A + B")
            .unwrap()
            .evaluate(&[vol_a, vol_b], &dir.path().join("out.bvf"), dir.path())
            .unwrap_err();
        assert!(matches!(err, ConvertError::Incompatible(_)));
    }

    #[test]
    fn evaluation_skips_wide_kinds() {
        for kind in [
            NumericKind::U8,
            NumericKind::I8,
            NumericKind::U16,
            NumericKind::I16,
            NumericKind::F32,
        ] {
            assert!(eval_supported(kind), "{kind} should be evaluable");
        }
        for kind in [
            NumericKind::U32,
            NumericKind::I32,
            NumericKind::U64,
            NumericKind::I64,
            NumericKind::F64,
        ] {
            assert!(!eval_supported(kind), "{kind} should be skipped");
        }
    }

    #[test]
    fn parse_errors_carry_a_position() {
        match ExpressionEvaluator::new("A + ") {
            Err(ConvertError::Parse { position, .. }) => assert_eq!(position, 2),
            other => panic!("expected parse error, got {:?}", other.is_ok()),
        }
        assert!(ExpressionEvaluator::new("A ? B").is_err());
        assert!(ExpressionEvaluator::new("(A + B").is_err());
        assert!(ExpressionEvaluator::new("3.1.4 + A").is_err());
        assert!(ExpressionEvaluator::new("17 * 3").is_err(), "no volume referenced");
    }

    #[test]
    fn too_few_volumes_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = ExpressionEvaluator::new("A + C").unwrap();
        assert_eq!(evaluator.placeholder_count(), 3);
        let err = evaluator
            .evaluate(
                &[dir.path().join("only.bvf")],
                &dir.path().join("out.bvf"),
                dir.path(),
            )
            .unwrap_err();
        assert!(matches!(err, ConvertError::Incompatible(_)));
    }
}
