use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{DefaultValue, EvalContext, InferContext, InputSpec, OpDef, OpError};
use crate::ops::{check_rank, op_inputs};
use crate::types::{DType, TensorType, ValueType};
use crate::value::Value;

#[derive(Debug)]
struct NmsBox {
    /// Top, left, bottom, right coordinates of box.
    tlbr: [f32; 4],

    /// Index of this box within the image.
    box_index: usize,

    /// Class with maximum probability score for this box.
    class: usize,

    /// Probability score for `class` for this box.
    score: f32,
}

fn area(tlbr: [f32; 4]) -> f32 {
    let [t, l, b, r] = tlbr;
    let height = (b - t).max(0.);
    let width = (r - l).max(0.);
    height * width
}

impl NmsBox {
    /// Return the Intersection-over-Union score of this box and `other`.
    fn iou(&self, other: &NmsBox) -> f32 {
        let [top, left, bottom, right] = self.tlbr;
        let [other_top, other_left, other_bottom, other_right] = other.tlbr;
        let intersection = area([
            top.max(other_top),
            left.max(other_left),
            bottom.min(other_bottom),
            right.min(other_right),
        ]);
        let union = area(self.tlbr) + area(other.tlbr) - intersection;
        if union <= 0. {
            0.
        } else {
            intersection / union
        }
    }
}

pub struct NmsOptions {
    pub iou_threshold: f32,
    pub score_threshold: f32,
    pub max_boxes: usize,
    pub per_class_suppression: bool,
}

/// Results of [`non_max_suppression`], padded to `max_boxes` per batch item.
pub struct NmsOutput {
    pub boxes: Tensor<f32>,
    pub scores: Tensor<f32>,
    pub indices: Tensor<i32>,
    pub counts: Tensor<i32>,
}

/// Greedily select boxes in descending order of score, skipping boxes which
/// overlap a selected box by more than `iou_threshold`.
///
/// `boxes` has shape `[n, B, 4]` with boxes as `[center_x, center_y, width,
/// height]` and `scores` has shape `[n, B, K]`.
pub fn non_max_suppression(
    boxes: &Tensor<f32>,
    scores: &Tensor<f32>,
    opts: &NmsOptions,
) -> Result<NmsOutput, OpError> {
    let &[batch, n_boxes, n_coords] = boxes.shape() else {
        return Err(OpError::InvalidShape("boxes should be rank 3".into()));
    };
    let &[scores_batch, scores_n_boxes, n_classes] = scores.shape() else {
        return Err(OpError::InvalidShape("scores should be rank 3".into()));
    };
    if n_coords != 4 {
        return Err(OpError::InvalidShape(
            "boxes last dimension should have size 4".into(),
        ));
    }
    if batch != scores_batch || n_boxes != scores_n_boxes {
        return Err(OpError::InvalidShape(format!(
            "boxes {:?} and scores {:?} have incompatible shapes",
            boxes.shape(),
            scores.shape()
        )));
    }

    let max_boxes = opts.max_boxes;
    let box_data = boxes.to_vec();
    let score_data = scores.to_vec();

    let mut out_boxes = vec![0.; batch * max_boxes * 4];
    let mut out_scores = vec![0.; batch * max_boxes * n_classes];
    let mut out_indices = vec![-1; batch * max_boxes];
    let mut counts = Vec::with_capacity(batch);

    for n in 0..batch {
        let mut candidates: Vec<NmsBox> = (0..n_boxes)
            .filter_map(|b| {
                let offset = (n * n_boxes + b) * n_classes;
                let (class, score) = score_data[offset..offset + n_classes]
                    .iter()
                    .copied()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
                if score < opts.score_threshold {
                    return None;
                }
                let offset = (n * n_boxes + b) * 4;
                let [x, y, w, h] = [
                    box_data[offset],
                    box_data[offset + 1],
                    box_data[offset + 2],
                    box_data[offset + 3],
                ];
                Some(NmsBox {
                    tlbr: [y - h / 2., x - w / 2., y + h / 2., x + w / 2.],
                    box_index: b,
                    class,
                    score,
                })
            })
            .collect();

        // Stable sort, so ties keep box order.
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut selected: Vec<NmsBox> = Vec::new();
        for candidate in candidates {
            if selected.len() == max_boxes {
                break;
            }
            let suppressed = selected.iter().any(|other| {
                (!opts.per_class_suppression || other.class == candidate.class)
                    && candidate.iou(other) > opts.iou_threshold
            });
            if !suppressed {
                selected.push(candidate);
            }
        }

        for (i, nms_box) in selected.iter().enumerate() {
            let src = (n * n_boxes + nms_box.box_index) * 4;
            let dst = (n * max_boxes + i) * 4;
            out_boxes[dst..dst + 4].copy_from_slice(&box_data[src..src + 4]);

            let src = (n * n_boxes + nms_box.box_index) * n_classes;
            let dst = (n * max_boxes + i) * n_classes;
            out_scores[dst..dst + n_classes].copy_from_slice(&score_data[src..src + n_classes]);

            out_indices[n * max_boxes + i] = nms_box.box_index as i32;
        }
        counts.push(selected.len() as i32);
    }

    Ok(NmsOutput {
        boxes: Tensor::from_data(&[batch, max_boxes, 4], out_boxes),
        scores: Tensor::from_data(&[batch, max_boxes, n_classes], out_scores),
        indices: Tensor::from_data(&[batch, max_boxes], out_indices),
        counts: Tensor::from_data(&[batch], counts),
    })
}

/// Select a subset of boxes by score, suppressing overlapping boxes.
///
/// Returns the selected boxes and their scores, the indices of selected
/// boxes and the number of boxes selected for each batch item. Outputs are
/// padded to `max_boxes` with zeros and index -1.
#[derive(Debug, Default)]
pub struct NonMaximumSuppression {}

impl OpDef for NonMaximumSuppression {
    fn name(&self) -> &'static str {
        "non_maximum_suppression"
    }

    op_inputs!(
        InputSpec::float("boxes"),
        InputSpec::float("scores"),
        InputSpec::float("iou_threshold")
            .constant()
            .default(DefaultValue::F32(0.5)),
        InputSpec::float("score_threshold")
            .constant()
            .default(DefaultValue::F32(f32::NEG_INFINITY)),
        InputSpec::int("max_boxes")
            .constant()
            .default(DefaultValue::I32(1)),
        InputSpec::boolean("per_class_suppression")
            .constant()
            .default(DefaultValue::Bool(false)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let boxes = ctx.tensor("boxes")?;
        let scores = ctx.tensor("scores")?;
        check_rank(boxes, "boxes", 3)?;
        check_rank(scores, "scores", 3)?;
        if let Some(Dim::Fixed(n_coords)) = boxes.shape.dim(2) {
            if n_coords != 4 {
                return Err(OpError::InvalidShape(
                    "boxes last dimension should have size 4".into(),
                ));
            }
        }
        let max_boxes = ctx.i32("max_boxes")?;
        if max_boxes < 1 {
            return Err(OpError::InvalidValue(format!(
                "max_boxes should be positive but got {}",
                max_boxes
            )));
        }
        let max_boxes = Dim::Fixed(max_boxes as usize);

        let batch = match (boxes.shape.dim(0), scores.shape.dim(0)) {
            (Some(Dim::Fixed(n)), _) | (_, Some(Dim::Fixed(n))) => Dim::Fixed(n),
            _ => Dim::new_symbol(),
        };
        let n_classes = scores.shape.dim(2).unwrap_or_else(Dim::new_symbol);

        let tensor = |dims: Vec<Dim>, dtype| {
            ValueType::Tensor(TensorType::new(Shape::from_dims(dims), dtype))
        };
        Ok(vec![
            tensor(vec![batch, max_boxes, Dim::Fixed(4)], boxes.dtype),
            tensor(vec![batch, max_boxes, n_classes], scores.dtype),
            tensor(vec![batch, max_boxes], DType::Int32),
            tensor(vec![batch], DType::Int32),
        ])
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let opts = NmsOptions {
            iou_threshold: ctx.f32("iou_threshold")?,
            score_threshold: ctx.f32("score_threshold")?,
            max_boxes: ctx.i32("max_boxes")?.max(0) as usize,
            per_class_suppression: ctx.bool("per_class_suppression")?,
        };
        let out = non_max_suppression(&ctx.float("boxes")?, &ctx.float("scores")?, &opts)?;
        Ok(vec![
            out.boxes.into(),
            out.scores.into(),
            out.indices.into(),
            out.counts.into(),
        ])
    }
}
