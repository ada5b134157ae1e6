//! Spatial resampling of `[..., H, W]` tensors.

use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::{check_min_rank, check_rank, op_inputs, ranked_dims};
use crate::types::ValueType;
use crate::value::{map_tensor, Value};

/// A single `H x W` plane of a tensor.
struct Image<'a> {
    data: &'a [f32],
    height: usize,
    width: usize,
}

impl Image<'_> {
    /// Sample the image at a fractional coordinate with bilinear
    /// interpolation, clamping the coordinate to the image.
    fn bilinear(&self, y: f32, x: f32) -> f32 {
        let y = y.clamp(0., self.height as f32 - 1.);
        let x = x.clamp(0., self.width as f32 - 1.);
        let y1 = y as usize;
        let y2 = (y1 + 1).min(self.height - 1);
        let x1 = x as usize;
        let x2 = (x1 + 1).min(self.width - 1);
        let weight_y = y - y1 as f32;
        let weight_x = x - x1 as f32;

        let at = |y: usize, x: usize| self.data[y * self.width + x];

        // Interpolate in X direction
        let top = (1. - weight_x) * at(y1, x1) + weight_x * at(y1, x2);
        let bottom = (1. - weight_x) * at(y2, x1) + weight_x * at(y2, x2);

        // Interpolate in Y direction
        (1. - weight_y) * top + weight_y * bottom
    }
}

/// Apply `f` to each `H x W` plane of `x`, where `f` writes an
/// `out_h x out_w` plane.
fn map_planes(
    x: &Tensor<f32>,
    out_h: usize,
    out_w: usize,
    mut f: impl FnMut(&Image, &mut [f32]),
) -> Tensor<f32> {
    let rank = x.ndim();
    let [height, width] = [x.size(rank - 2), x.size(rank - 1)];
    let data = x.to_vec();
    let n_planes: usize = x.shape()[..rank - 2].iter().product();

    let mut out = vec![0.; n_planes * out_h * out_w];
    for p in 0..n_planes {
        let image = Image {
            data: &data[p * height * width..(p + 1) * height * width],
            height,
            width,
        };
        f(&image, &mut out[p * out_h * out_w..(p + 1) * out_h * out_w]);
    }

    let mut out_shape = x.shape()[..rank - 2].to_vec();
    out_shape.extend([out_h, out_w]);
    Tensor::from_data(out_shape.as_slice(), out)
}

/// Replace the last two dims of a ranked shape.
fn with_spatial_dims(dims: &[Dim], h: Dim, w: Dim) -> Shape {
    let mut out = dims[..dims.len() - 2].to_vec();
    out.extend([h, w]);
    Shape::from_dims(out)
}

/// Validate a pair of crop amounts for a dim.
fn crop_pair(values: &[i32], name: &str) -> Result<[usize; 2], OpError> {
    match values {
        &[a, b] if a >= 0 && b >= 0 => Ok([a as usize, b as usize]),
        _ => Err(OpError::InvalidValue(format!(
            "{} should be two non-negative values but got {:?}",
            name, values
        ))),
    }
}

fn cropped_size(size: usize, [before, after]: [usize; 2], name: &str) -> Result<usize, OpError> {
    size.checked_sub(before + after)
        .filter(|&size| size > 0)
        .ok_or_else(|| {
            OpError::InvalidValue(format!(
                "{} [{}, {}] removes the whole dim of size {}",
                name, before, after, size
            ))
        })
}

/// Remove `crop_height = [top, bottom]` rows and `crop_width = [left,
/// right]` columns from the edges of the last two dims.
#[derive(Debug, Default)]
pub struct Crop {}

impl OpDef for Crop {
    fn name(&self) -> &'static str {
        "crop"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("crop_height").constant(),
        InputSpec::int("crop_width").constant(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        check_min_rank(x, "x", 2)?;
        let crop_h = crop_pair(&ctx.i32s("crop_height")?, "crop_height")?;
        let crop_w = crop_pair(&ctx.i32s("crop_width")?, "crop_width")?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let crop_dim = |dim: Dim, pair: [usize; 2], name: &str| match dim {
            Dim::Fixed(size) => cropped_size(size, pair, name).map(Dim::Fixed),
            Dim::Symbol(_) => Ok(Dim::new_symbol()),
        };
        let h = crop_dim(dims[dims.len() - 2], crop_h, "crop_height")?;
        let w = crop_dim(dims[dims.len() - 1], crop_w, "crop_width")?;
        single_output(with_spatial_dims(dims, h, w), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let rank = x.ndim();
        if rank < 2 {
            return Err(OpError::InvalidShape("x should be at least rank 2".into()));
        }
        let shape = x.shape();
        let [top, bottom] = crop_pair(&ctx.i32s("crop_height")?, "crop_height")?;
        let [left, right] = crop_pair(&ctx.i32s("crop_width")?, "crop_width")?;
        let h = cropped_size(shape[rank - 2], [top, bottom], "crop_height")?;
        let w = cropped_size(shape[rank - 1], [left, right], "crop_width")?;

        map_tensor!(x, t => t
            .slice_axis(rank - 2, top..top + h)
            .slice_axis(rank - 1, left..left + w)
            .to_tensor())
        .into_op_result()
    }
}

/// Repeat each element `scale_factor_height` times along the height and
/// `scale_factor_width` times along the width.
#[derive(Debug, Default)]
pub struct UpsampleNearestNeighbor {}

impl UpsampleNearestNeighbor {
    fn scales(get: impl Fn(&str) -> Result<i32, OpError>) -> Result<[usize; 2], OpError> {
        let [h, w] = [get("scale_factor_height")?, get("scale_factor_width")?];
        if h < 1 || w < 1 {
            return Err(OpError::InvalidValue(format!(
                "scale factors should be positive integers but got {} and {}",
                h, w
            )));
        }
        Ok([h as usize, w as usize])
    }
}

impl OpDef for UpsampleNearestNeighbor {
    fn name(&self) -> &'static str {
        "upsample_nearest_neighbor"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("scale_factor_height")
            .constant()
            .default(DefaultValue::I32(1)),
        InputSpec::int("scale_factor_width")
            .constant()
            .default(DefaultValue::I32(1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        check_min_rank(x, "x", 3)?;
        let [sh, sw] = Self::scales(|name| ctx.i32(name))?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let scale = |dim: Dim, s: usize| match dim {
            Dim::Fixed(size) => Dim::Fixed(size * s),
            Dim::Symbol(_) if s == 1 => dim,
            Dim::Symbol(_) => Dim::new_symbol(),
        };
        let h = scale(dims[dims.len() - 2], sh);
        let w = scale(dims[dims.len() - 1], sw);
        single_output(with_spatial_dims(dims, h, w), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        if x.ndim() < 3 {
            return Err(OpError::InvalidShape("x should be at least rank 3".into()));
        }
        let [sh, sw] = Self::scales(|name| ctx.i32(name))?;
        let rank = x.ndim();
        let (out_h, out_w) = (x.size(rank - 2) * sh, x.size(rank - 1) * sw);
        map_planes(&x, out_h, out_w, |image, out| {
            for y in 0..out_h {
                for x in 0..out_w {
                    out[y * out_w + x] = image.data[(y / sh) * image.width + x / sw];
                }
            }
        })
        .into_op_result()
    }
}

/// Input coordinate that corresponds to an output coordinate when resizing
/// a dim from `in_size` to `out_size`.
fn bilinear_coord(dest: usize, in_size: usize, out_size: usize, align_corners: bool) -> f32 {
    if align_corners {
        if out_size > 1 {
            dest as f32 * (in_size as f32 - 1.) / (out_size as f32 - 1.)
        } else {
            0.
        }
    } else {
        let scale = in_size as f32 / out_size as f32;
        scale * (dest as f32 + 0.5) - 0.5
    }
}

/// Resize the last two dims by fractional scale factors with bilinear
/// interpolation.
///
/// With `align_corners` the corner pixels of the input and output are
/// aligned. Otherwise pixel centers are aligned.
#[derive(Debug, Default)]
pub struct UpsampleBilinear {}

impl UpsampleBilinear {
    fn out_size(size: usize, scale: f32) -> usize {
        (size as f32 * scale).floor() as usize
    }

    fn scales(h: f32, w: f32) -> Result<[f32; 2], OpError> {
        if !(h > 0. && w > 0.) {
            return Err(OpError::InvalidValue(format!(
                "scale factors should be positive but got {} and {}",
                h, w
            )));
        }
        Ok([h, w])
    }
}

impl OpDef for UpsampleBilinear {
    fn name(&self) -> &'static str {
        "upsample_bilinear"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("scale_factor_height")
            .constant()
            .default(DefaultValue::F32(1.)),
        InputSpec::float("scale_factor_width")
            .constant()
            .default(DefaultValue::F32(1.)),
        InputSpec::boolean("align_corners")
            .constant()
            .default(DefaultValue::Bool(true)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        check_min_rank(x, "x", 3)?;
        let [sh, sw] = Self::scales(
            ctx.f32("scale_factor_height")?,
            ctx.f32("scale_factor_width")?,
        )?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let scale = |dim: Dim, s: f32| match dim {
            Dim::Fixed(size) => Dim::Fixed(Self::out_size(size, s)),
            Dim::Symbol(_) => Dim::new_symbol(),
        };
        let h = scale(dims[dims.len() - 2], sh);
        let w = scale(dims[dims.len() - 1], sw);
        single_output(with_spatial_dims(dims, h, w), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        if x.ndim() < 3 {
            return Err(OpError::InvalidShape("x should be at least rank 3".into()));
        }
        let [sh, sw] = Self::scales(
            ctx.f32("scale_factor_height")?,
            ctx.f32("scale_factor_width")?,
        )?;
        let align_corners = ctx.bool("align_corners")?;
        let rank = x.ndim();
        let (in_h, in_w) = (x.size(rank - 2), x.size(rank - 1));
        let (out_h, out_w) = (Self::out_size(in_h, sh), Self::out_size(in_w, sw));

        map_planes(&x, out_h, out_w, |image, out| {
            for y in 0..out_h {
                let in_y = bilinear_coord(y, in_h, out_h, align_corners);
                for x in 0..out_w {
                    let in_x = bilinear_coord(x, in_w, out_w, align_corners);
                    out[y * out_w + x] = image.bilinear(in_y, in_x);
                }
            }
        })
        .into_op_result()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum BoxCoordinateMode {
    CornersHeightFirst,
    CornersWidthFirst,
    CenterSizeHeightFirst,
    CenterSizeWidthFirst,
}

impl BoxCoordinateMode {
    fn parse(mode: &str) -> Result<BoxCoordinateMode, OpError> {
        match mode {
            "CORNERS_HEIGHT_FIRST" => Ok(BoxCoordinateMode::CornersHeightFirst),
            "CORNERS_WIDTH_FIRST" => Ok(BoxCoordinateMode::CornersWidthFirst),
            "CENTER_SIZE_HEIGHT_FIRST" => Ok(BoxCoordinateMode::CenterSizeHeightFirst),
            "CENTER_SIZE_WIDTH_FIRST" => Ok(BoxCoordinateMode::CenterSizeWidthFirst),
            _ => Err(OpError::InvalidValue(format!(
                "unknown box_coordinate_mode \"{}\"",
                mode
            ))),
        }
    }

    /// Convert box coordinates to `[y1, x1, y2, x2]`.
    fn to_corners(self, [a, b, c, d]: [f32; 4]) -> [f32; 4] {
        match self {
            BoxCoordinateMode::CornersHeightFirst => [a, b, c, d],
            BoxCoordinateMode::CornersWidthFirst => [b, a, d, c],
            BoxCoordinateMode::CenterSizeHeightFirst => {
                [a - c / 2., b - d / 2., a + c / 2., b + d / 2.]
            }
            BoxCoordinateMode::CenterSizeWidthFirst => {
                [b - d / 2., a - c / 2., b + d / 2., a + c / 2.]
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum SamplingMode {
    AlignCorners,
    UnalignCorners,
}

impl SamplingMode {
    fn parse(mode: &str) -> Result<SamplingMode, OpError> {
        match mode {
            "DEFAULT" | "STRICT_ALIGN_CORNERS" | "ALIGN_CORNERS" => Ok(SamplingMode::AlignCorners),
            "UNALIGN_CORNERS" => Ok(SamplingMode::UnalignCorners),
            _ => Err(OpError::InvalidValue(format!(
                "unknown sampling_mode \"{}\"",
                mode
            ))),
        }
    }

    /// Position of sample `i` of `n` between `start` and `end`.
    fn sample(self, start: f32, end: f32, i: usize, n: usize) -> f32 {
        match self {
            SamplingMode::AlignCorners if n > 1 => {
                start + i as f32 * (end - start) / (n as f32 - 1.)
            }
            SamplingMode::AlignCorners => (start + end) / 2.,
            SamplingMode::UnalignCorners => {
                let spacing = (end - start) / n as f32;
                start + (i as f32 + 0.5) * spacing - 0.5
            }
        }
    }
}

struct CropResizeParams {
    target_height: usize,
    target_width: usize,
    normalized_coordinates: bool,
    spatial_scale: f32,
    box_mode: BoxCoordinateMode,
    sampling_mode: SamplingMode,
}

/// Number of values per box in `roi`, and whether the first is a batch
/// index.
fn roi_box_len(roi: &[Dim]) -> Result<Option<usize>, OpError> {
    let len = match roi {
        [_, len] => *len,
        [_, Dim::Fixed(1), len, Dim::Fixed(1), Dim::Fixed(1)] => *len,
        _ => {
            return Err(OpError::InvalidShape(
                "roi should have shape [N, 4 or 5] or [N, 1, 4 or 5, 1, 1]".into(),
            ))
        }
    };
    match len {
        Dim::Fixed(4) | Dim::Fixed(5) => Ok(len.fixed()),
        Dim::Symbol(_) => Ok(None),
        Dim::Fixed(n) => Err(OpError::InvalidShape(format!(
            "roi boxes should have 4 or 5 values but have {}",
            n
        ))),
    }
}

fn crop_resize(
    x: &Tensor<f32>,
    roi: &Tensor<f32>,
    params: &CropResizeParams,
) -> Result<Tensor<f32>, OpError> {
    let &[batch, chans, height, width] = x.shape() else {
        return Err(OpError::InvalidShape("x should be rank 4".into()));
    };
    let n_rois = roi.size(0);
    let box_len = if n_rois == 0 { 4 } else { roi.len() / n_rois };
    if box_len != 4 && box_len != 5 {
        return Err(OpError::InvalidShape(format!(
            "roi boxes should have 4 or 5 values but have {}",
            box_len
        )));
    }
    let has_index = box_len == 5;
    let out_batch = if has_index { 1 } else { batch };
    let (th, tw) = (params.target_height, params.target_width);

    let data = x.to_vec();
    let roi_data = roi.to_vec();
    let plane_len = height * width;
    let mut out = Vec::with_capacity(n_rois * out_batch * chans * th * tw);

    for r in 0..n_rois {
        let values = &roi_data[r * box_len..(r + 1) * box_len];
        let (batches, coords) = if has_index {
            let index = values[0];
            if index < 0. || index as usize >= batch {
                return Err(OpError::InvalidValue(format!(
                    "roi batch index {} is out of bounds for batch size {}",
                    index, batch
                )));
            }
            (index as usize..index as usize + 1, &values[1..])
        } else {
            (0..batch, values)
        };

        let [mut y1, mut x1, mut y2, mut x2] =
            params
                .box_mode
                .to_corners([coords[0], coords[1], coords[2], coords[3]]);
        if params.normalized_coordinates {
            let (sy, sx) = (height as f32 - 1., width as f32 - 1.);
            [y1, x1, y2, x2] = [y1 * sy, x1 * sx, y2 * sy, x2 * sx];
        } else {
            let s = params.spatial_scale;
            [y1, x1, y2, x2] = [y1 * s, x1 * s, y2 * s, x2 * s];
        }

        for b in batches {
            for c in 0..chans {
                let offset = (b * chans + c) * plane_len;
                let image = Image {
                    data: &data[offset..offset + plane_len],
                    height,
                    width,
                };
                for i in 0..th {
                    let y = params.sampling_mode.sample(y1, y2, i, th);
                    for j in 0..tw {
                        let x = params.sampling_mode.sample(x1, x2, j, tw);
                        out.push(image.bilinear(y, x));
                    }
                }
            }
        }
    }

    Ok(Tensor::from_data(&[n_rois, out_batch, chans, th, tw], out))
}

/// Extract boxes from `x` and resize each to `target_height x
/// target_width` with bilinear sampling.
///
/// `x` has shape `[B, C, H, W]`. Each box in `roi` has 4 coordinates and
/// is taken from every batch item, or 5 values where the first is the
/// index of the batch item to crop. The output has shape `[N, B, C,
/// target_height, target_width]`, with `B = 1` for boxes with a batch index.
#[derive(Debug, Default)]
pub struct CropResize {}

impl CropResize {
    fn params(
        get_i32: impl Fn(&str) -> Result<i32, OpError>,
        normalized_coordinates: bool,
        spatial_scale: f32,
        box_mode: &str,
        sampling_mode: &str,
    ) -> Result<CropResizeParams, OpError> {
        let [th, tw] = [get_i32("target_height")?, get_i32("target_width")?];
        if th < 1 || tw < 1 {
            return Err(OpError::InvalidValue(format!(
                "target size should be positive but got {}x{}",
                th, tw
            )));
        }
        Ok(CropResizeParams {
            target_height: th as usize,
            target_width: tw as usize,
            normalized_coordinates,
            spatial_scale,
            box_mode: BoxCoordinateMode::parse(box_mode)?,
            sampling_mode: SamplingMode::parse(sampling_mode)?,
        })
    }
}

impl OpDef for CropResize {
    fn name(&self) -> &'static str {
        "crop_resize"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("roi"),
        InputSpec::int("target_height")
            .constant()
            .default(DefaultValue::I32(1)),
        InputSpec::int("target_width")
            .constant()
            .default(DefaultValue::I32(1)),
        InputSpec::boolean("normalized_coordinates")
            .constant()
            .default(DefaultValue::Bool(false)),
        InputSpec::float("spatial_scale")
            .constant()
            .default(DefaultValue::F32(1.)),
        InputSpec::string("box_coordinate_mode")
            .default(DefaultValue::Str("CORNERS_HEIGHT_FIRST")),
        InputSpec::string("sampling_mode").default(DefaultValue::Str("DEFAULT")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        check_rank(x, "x", 4)?;
        let roi = ranked_dims(ctx.shape("roi")?, "roi")?;
        let params = Self::params(
            |name| ctx.i32(name),
            ctx.bool("normalized_coordinates")?,
            ctx.f32("spatial_scale")?,
            ctx.str("box_coordinate_mode")?,
            ctx.str("sampling_mode")?,
        )?;

        let (batch, chans) = match x.shape.dims() {
            Some(dims) => (dims[0], dims[1]),
            None => (Dim::new_symbol(), Dim::new_symbol()),
        };
        let out_batch = match roi_box_len(roi)? {
            Some(5) => Dim::Fixed(1),
            Some(_) => batch,
            None => Dim::new_symbol(),
        };
        single_output(
            Shape::from_dims([
                roi[0],
                out_batch,
                chans,
                Dim::Fixed(params.target_height),
                Dim::Fixed(params.target_width),
            ]),
            x.dtype,
        )
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let params = Self::params(
            |name| ctx.i32(name),
            ctx.bool("normalized_coordinates")?,
            ctx.f32("spatial_scale")?,
            ctx.str("box_coordinate_mode")?,
            ctx.str("sampling_mode")?,
        )?;
        crop_resize(&ctx.float("x")?, &ctx.float("roi")?, &params).into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use super::{crop_resize, BoxCoordinateMode, CropResizeParams, SamplingMode};
    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::types::ValueType;
    use crate::value::Value;

    fn fold(op: &str, args: Vec<(&str, Arg)>) -> Result<Value, BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let mut builder = mb.op(op);
            for (name, arg) in args {
                builder = builder.arg(name, arg);
            }
            let out = builder.build1()?;
            result = mb.value(out).cloned();
            Ok(vec![out])
        })?;
        Ok(result.unwrap())
    }

    fn image() -> Tensor<f32> {
        Tensor::from_data(&[1, 1, 2, 2], vec![1., 2., 3., 4.])
    }

    #[test]
    fn test_crop() {
        let x = Tensor::from_data(&[1, 3, 4], (0..12).map(|v| v as f32).collect::<Vec<_>>());
        let out = fold(
            "crop",
            vec![
                ("x", x.clone().into()),
                ("crop_height", [1, 0].into()),
                ("crop_width", [1, 1].into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [1, 2, 2]);
        assert_eq!(out.to_f32_vec().unwrap(), [5., 6., 9., 10.]);

        let err = fold(
            "crop",
            vec![
                ("x", x.into()),
                ("crop_height", [2, 1].into()),
                ("crop_width", [0, 0].into()),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("removes the whole dim"));
    }

    #[test]
    fn test_upsample_nearest_neighbor() {
        let out = fold(
            "upsample_nearest_neighbor",
            vec![
                ("x", image().into()),
                ("scale_factor_height", 2.into()),
                ("scale_factor_width", 1.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [1, 1, 4, 2]);
        assert_eq!(out.to_f32_vec().unwrap(), [1., 2., 1., 2., 3., 4., 3., 4.]);
    }

    #[test]
    fn test_upsample_bilinear() {
        let out = fold(
            "upsample_bilinear",
            vec![
                ("x", image().into()),
                ("scale_factor_height", 1.5f32.into()),
                ("scale_factor_width", 1.5f32.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [1, 1, 3, 3]);
        assert_eq!(
            out.to_f32_vec().unwrap(),
            [1., 1.5, 2., 2., 2.5, 3., 3., 3.5, 4.]
        );

        let out = fold(
            "upsample_bilinear",
            vec![
                ("x", image().into()),
                ("scale_factor_height", 2.0f32.into()),
                ("scale_factor_width", 2.0f32.into()),
                ("align_corners", false.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [1, 1, 4, 4]);
        assert_eq!(
            &out.to_f32_vec().unwrap()[..4],
            [1., 1.25, 1.75, 2.]
        );
    }

    #[test]
    fn test_crop_resize() {
        let x = Tensor::from_data(&[1, 1, 3, 3], (0..9).map(|v| v as f32).collect::<Vec<_>>());
        let params = CropResizeParams {
            target_height: 2,
            target_width: 2,
            normalized_coordinates: false,
            spatial_scale: 1.,
            box_mode: BoxCoordinateMode::CornersHeightFirst,
            sampling_mode: SamplingMode::AlignCorners,
        };

        // Box covering the bottom-right 2x2 corner.
        let roi = Tensor::from_data(&[1, 4], vec![1., 1., 2., 2.]);
        let out = crop_resize(&x, &roi, &params).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 2, 2]);
        assert_eq!(out.to_vec(), [4., 5., 7., 8.]);

        // Same box with a batch index and normalized width-first corners.
        let params = CropResizeParams {
            normalized_coordinates: true,
            box_mode: BoxCoordinateMode::CornersWidthFirst,
            ..params
        };
        let roi = Tensor::from_data(&[1, 5], vec![0., 0.5, 0., 1., 0.5]);
        let out = crop_resize(&x, &roi, &params).unwrap();
        assert_eq!(out.to_vec(), [1., 2., 4., 5.]);

        let roi = Tensor::from_data(&[1, 5], vec![3., 0., 0., 1., 1.]);
        assert!(crop_resize(&x, &roi, &params).is_err());
    }
}
