use ndarray::{ArrayD, Axis, IxDyn, SliceInfo, SliceInfoElem};
use serde_json::Value;

use crate::codec::Codec;
use crate::shape::TileSel;
use crate::{SlabError, SlabResult};

/// One rectangular payload: either a dense numeric tile or a generic
/// structured value.
///
/// Dense tiles hold `f64` elements in an [`ndarray::ArrayD`]; generic tiles
/// hold any self-describing [`serde_json::Value`] whose shape is probed by
/// descending through nested arrays. The assembly primitives the reader
/// needs (stack, concat, slice, squeeze) live here.
#[derive(Debug, Clone, PartialEq)]
pub enum Slab {
    /// Dense numeric N-D tile.
    Dense(ArrayD<f64>),
    /// Generic structured tile.
    Object(Value),
}

impl From<ArrayD<f64>> for Slab {
    fn from(array: ArrayD<f64>) -> Self {
        Slab::Dense(array)
    }
}

impl From<Value> for Slab {
    fn from(value: Value) -> Self {
        Slab::Object(value)
    }
}

impl Slab {
    /// The extent along each axis.
    ///
    /// Generic values report the nesting depth of non-empty arrays, probed
    /// through the first element; a scalar has the empty shape.
    #[must_use]
    pub fn shape(&self) -> Vec<u64> {
        match self {
            Slab::Dense(a) => a.shape().iter().map(|&d| d as u64).collect(),
            Slab::Object(v) => {
                let mut shape = Vec::new();
                let mut cursor = v;
                while let Value::Array(items) = cursor {
                    if items.is_empty() {
                        break;
                    }
                    shape.push(items.len() as u64);
                    cursor = &items[0];
                }
                shape
            }
        }
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        match self {
            Slab::Dense(a) => a.ndim(),
            Slab::Object(_) => self.shape().len(),
        }
    }

    pub(crate) fn kind_tag(&self) -> &'static str {
        match self {
            Slab::Dense(_) => "dense",
            Slab::Object(_) => "object",
        }
    }

    /// Stack `lower` onto `acc` along a leading stack axis.
    ///
    /// With `acc == None` this prepends a new axis 0 of extent 1; afterwards
    /// it appends along axis 0. Both operands must use the same codec.
    pub fn stack(acc: Option<Slab>, lower: Slab) -> SlabResult<Slab> {
        let Some(acc) = acc else {
            return Ok(match lower {
                Slab::Dense(a) => Slab::Dense(a.insert_axis(Axis(0))),
                Slab::Object(v) => Slab::Object(Value::Array(vec![v])),
            });
        };
        match (acc, lower) {
            (Slab::Dense(acc), Slab::Dense(lower)) => {
                let lower = lower.insert_axis(Axis(0));
                ndarray::concatenate(Axis(0), &[acc.view(), lower.view()])
                    .map(Slab::Dense)
                    .map_err(|_| shape_mismatch(acc.shape(), lower.shape()))
            }
            (Slab::Object(acc), Slab::Object(lower)) => {
                let mut items = match acc {
                    Value::Array(items) => items,
                    scalar => vec![scalar],
                };
                items.push(lower);
                Ok(Slab::Object(Value::Array(items)))
            }
            (acc, lower) => Err(SlabError::UnsupportedCodec(
                acc.kind_tag(),
                lower.kind_tag(),
            )),
        }
    }

    /// Concatenate two values along `axis`. Both must use the same codec and
    /// agree on every other axis.
    pub fn concat(self, other: Slab, axis: usize) -> SlabResult<Slab> {
        match (self, other) {
            (Slab::Dense(a), Slab::Dense(b)) => {
                ndarray::concatenate(Axis(axis), &[a.view(), b.view()])
                    .map(Slab::Dense)
                    .map_err(|_| shape_mismatch(a.shape(), b.shape()))
            }
            (Slab::Object(a), Slab::Object(b)) => json_concat(a, b, axis).map(Slab::Object),
            (a, b) => Err(SlabError::UnsupportedCodec(a.kind_tag(), b.kind_tag())),
        }
    }

    /// Apply resolved per-axis selectors. Missing trailing axes keep their
    /// full range; `TileSel::Index` drops its axis.
    pub fn slice(&self, key: &[TileSel]) -> SlabResult<Slab> {
        if key.len() > self.ndim() {
            return Err(SlabError::InvalidSlice(format!(
                "key has {} axes but the value has {}",
                key.len(),
                self.ndim()
            )));
        }
        for (sel, extent) in key.iter().zip(self.shape()) {
            let in_bounds = match sel {
                TileSel::Index(i) => *i < extent,
                TileSel::Slice { start, stop, step } => {
                    *step >= 1 && start <= stop && *stop <= extent
                }
            };
            if !in_bounds {
                return Err(SlabError::InvalidSlice(format!(
                    "selector {sel:?} out of bounds for axis of length {extent}"
                )));
            }
        }
        match self {
            Slab::Dense(a) => {
                let mut elems: Vec<SliceInfoElem> = key
                    .iter()
                    .map(|sel| match *sel {
                        TileSel::Index(i) => SliceInfoElem::Index(i as isize),
                        TileSel::Slice { start, stop, step } => SliceInfoElem::Slice {
                            start: start as isize,
                            end: Some(stop as isize),
                            step: step as isize,
                        },
                    })
                    .collect();
                elems.resize(a.ndim(), SliceInfoElem::from(..));
                let info: SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn> = elems
                    .try_into()
                    .map_err(|_| SlabError::InvalidSlice("unresolvable key".into()))?;
                Ok(Slab::Dense(a.slice(info).to_owned()))
            }
            Slab::Object(v) => json_slice(v, key).map(Slab::Object),
        }
    }

    /// The empty value of a codec, returned when a slice selects nothing.
    #[must_use]
    pub fn blank(codec: Codec) -> Slab {
        match codec {
            Codec::Dense => Slab::Dense(ArrayD::zeros(IxDyn(&[0]))),
            Codec::Object => Slab::Object(Value::Array(Vec::new())),
        }
    }

    /// Drop axis 0 when its extent is 1; otherwise return the value as-is.
    #[must_use]
    pub fn squeeze_axis0(self) -> Slab {
        match self {
            Slab::Dense(a) if a.shape().first() == Some(&1) => {
                Slab::Dense(a.index_axis_move(Axis(0), 0))
            }
            Slab::Object(Value::Array(mut items)) if items.len() == 1 => {
                Slab::Object(items.remove(0))
            }
            other => other,
        }
    }
}

fn shape_mismatch(a: &[usize], b: &[usize]) -> SlabError {
    SlabError::ShapeMismatch {
        expected: a.iter().map(|&d| d as u64).collect(),
        actual: b.iter().map(|&d| d as u64).collect(),
    }
}

fn json_shape_mismatch(a: &Value, b: &Value) -> SlabError {
    SlabError::ShapeMismatch {
        expected: Slab::Object(a.clone()).shape(),
        actual: Slab::Object(b.clone()).shape(),
    }
}

fn json_concat(a: Value, b: Value, axis: usize) -> SlabResult<Value> {
    match (a, b) {
        (Value::Array(mut left), Value::Array(right)) => {
            if axis == 0 {
                left.extend(right);
                return Ok(Value::Array(left));
            }
            if left.len() != right.len() {
                return Err(json_shape_mismatch(
                    &Value::Array(left),
                    &Value::Array(right),
                ));
            }
            left.into_iter()
                .zip(right)
                .map(|(l, r)| json_concat(l, r, axis - 1))
                .collect::<SlabResult<Vec<_>>>()
                .map(Value::Array)
        }
        (a, b) => Err(json_shape_mismatch(&a, &b)),
    }
}

fn json_slice(v: &Value, key: &[TileSel]) -> SlabResult<Value> {
    let Some(sel) = key.first() else {
        return Ok(v.clone());
    };
    let Value::Array(items) = v else {
        return Err(SlabError::InvalidSlice(
            "key has more axes than the value".into(),
        ));
    };
    match *sel {
        TileSel::Index(i) => {
            let item = items.get(i as usize).ok_or_else(|| {
                SlabError::InvalidSlice(format!("index {i} out of bounds"))
            })?;
            json_slice(item, &key[1..])
        }
        TileSel::Slice { start, stop, step } => items
            .get(start as usize..stop as usize)
            .unwrap_or(&[])
            .iter()
            .step_by(step as usize)
            .map(|item| json_slice(item, &key[1..]))
            .collect::<SlabResult<Vec<_>>>()
            .map(Value::Array),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use serde_json::json;

    use super::Slab;
    use crate::SlabError;
    use crate::shape::TileSel;

    fn dense(shape: &[usize]) -> Slab {
        let len: usize = shape.iter().product();
        let data: Vec<f64> = (0..len).map(|i| i as f64).collect();
        Slab::Dense(ArrayD::from_shape_vec(IxDyn(shape), data).unwrap())
    }

    #[test]
    fn object_shape_probes_nested_arrays() {
        assert_eq!(Slab::Object(json!([[1, 2, 3], [4, 5, 6]])).shape(), [2, 3]);
        assert_eq!(Slab::Object(json!(7)).shape(), Vec::<u64>::new());
        assert_eq!(Slab::Object(json!([])).shape(), Vec::<u64>::new());
    }

    #[test]
    fn stack_prepends_then_appends() {
        let a = Slab::Object(json!([1, 2]));
        let b = Slab::Object(json!([3, 4]));
        let stacked = Slab::stack(None, a).unwrap();
        assert_eq!(stacked.shape(), [1, 2]);
        let stacked = Slab::stack(Some(stacked), b).unwrap();
        assert_eq!(stacked, Slab::Object(json!([[1, 2], [3, 4]])));
    }

    #[test]
    fn stack_dense() {
        let stacked = Slab::stack(None, dense(&[4])).unwrap();
        let stacked = Slab::stack(Some(stacked), dense(&[4])).unwrap();
        assert_eq!(stacked.shape(), [2, 4]);
    }

    #[test]
    fn stack_rejects_mixed_codecs() {
        let acc = Slab::stack(None, dense(&[2])).unwrap();
        let err = Slab::stack(Some(acc), Slab::Object(json!([1, 2]))).unwrap_err();
        assert!(matches!(err, SlabError::UnsupportedCodec("dense", "object")));
    }

    #[test]
    fn concat_along_inner_axis() {
        let a = Slab::Object(json!([[1, 2], [3, 4]]));
        let b = Slab::Object(json!([[5], [6]]));
        let joined = a.concat(b, 1).unwrap();
        assert_eq!(joined, Slab::Object(json!([[1, 2, 5], [3, 4, 6]])));
    }

    #[test]
    fn concat_dense_zero_extent_piece() {
        let a = dense(&[2, 3]);
        let empty = a.slice(&[TileSel::Slice { start: 0, stop: 0, step: 1 }]).unwrap();
        assert_eq!(empty.shape(), [0, 3]);
        let joined = empty.concat(dense(&[2, 3]), 0).unwrap();
        assert_eq!(joined.shape(), [2, 3]);
    }

    #[test]
    fn slice_int_drops_axis() {
        let a = dense(&[2, 3]);
        let row = a.slice(&[TileSel::Index(1)]).unwrap();
        assert_eq!(row.shape(), [3]);
        match row {
            Slab::Dense(arr) => assert_eq!(arr.as_slice().unwrap(), [3.0, 4.0, 5.0]),
            Slab::Object(_) => panic!("expected dense"),
        }
    }

    #[test]
    fn slice_strided_object() {
        let v = Slab::Object(json!([0, 1, 2, 3, 4, 5, 6]));
        let picked = v
            .slice(&[TileSel::Slice { start: 1, stop: 6, step: 2 }])
            .unwrap();
        assert_eq!(picked, Slab::Object(json!([1, 3, 5])));
    }

    #[test]
    fn slice_rank_overflow_is_invalid() {
        let v = Slab::Object(json!([1, 2]));
        let err = v
            .slice(&[TileSel::Index(0), TileSel::Index(0)])
            .unwrap_err();
        assert!(matches!(err, SlabError::InvalidSlice(_)));
    }

    #[test]
    fn squeeze_only_unit_axis0() {
        assert_eq!(
            Slab::Object(json!([[1, 2]])).squeeze_axis0(),
            Slab::Object(json!([1, 2]))
        );
        assert_eq!(
            Slab::Object(json!([[1], [2]])).squeeze_axis0(),
            Slab::Object(json!([[1], [2]]))
        );
        assert_eq!(dense(&[1, 3]).squeeze_axis0().shape(), [3]);
    }
}
