//! Crop and letterbox geometry for the export variants.
//!
//! All values are integers computed before FFmpeg runs, so the same source and
//! target always produce the same filter graph.
//!
//! Crop boxes use pre-rotation source coordinates: the box is cut from the
//! frame as it is stored, and the `transpose=1` that follows turns it upright.

use vgen_models::{CropOverride, Resolution};

use crate::error::{MediaError, MediaResult};

/// Round down to an even value (minimum 2), as required by yuv420p.
pub fn even_floor(value: u32) -> u32 {
    (value & !1).max(2)
}

/// Crop rectangle in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropBox {
    /// Box of the target dimensions clamped to the source, centered unless overridden.
    ///
    /// Override offsets are clamped so the box stays inside the source frame.
    pub fn centered(
        source: Resolution,
        target: Resolution,
        offset: Option<CropOverride>,
    ) -> MediaResult<Self> {
        check_dims("source", source)?;
        check_dims("target", target)?;

        let width = even_floor(target.width.min(source.width));
        let height = even_floor(target.height.min(source.height));
        let max_x = source.width.saturating_sub(width);
        let max_y = source.height.saturating_sub(height);

        let (x, y) = match offset {
            Some(o) => (o.x.min(max_x), o.y.min(max_y)),
            None => (max_x / 2, max_y / 2),
        };

        Ok(Self {
            width,
            height,
            x,
            y,
        })
    }

    /// Dimensions after a 90 degree transpose.
    pub fn rotated(&self) -> Resolution {
        Resolution::new(self.height, self.width)
    }

    pub fn filter(&self) -> String {
        format!("crop={}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

/// Fit-inside scale plus padding to an exact canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePadGeometry {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl ScalePadGeometry {
    /// Scale `frame` to fit inside `canvas` preserving aspect ratio, then center it.
    pub fn fit(frame: Resolution, canvas: Resolution) -> MediaResult<Self> {
        check_dims("frame", frame)?;
        check_dims("canvas", canvas)?;

        let canvas_width = even_floor(canvas.width);
        let canvas_height = even_floor(canvas.height);

        let (fw, fh) = (u64::from(frame.width), u64::from(frame.height));
        let (cw, ch) = (u64::from(canvas_width), u64::from(canvas_height));

        // Integer cross-multiplication picks the limiting side without rounding drift.
        let (scaled_width, scaled_height) = if fw * ch >= fh * cw {
            (cw, fh * cw / fw)
        } else {
            (fw * ch / fh, ch)
        };
        let scaled_width = even_floor(scaled_width as u32).min(canvas_width);
        let scaled_height = even_floor(scaled_height as u32).min(canvas_height);

        Ok(Self {
            scaled_width,
            scaled_height,
            canvas_width,
            canvas_height,
            pad_x: (canvas_width - scaled_width) / 2,
            pad_y: (canvas_height - scaled_height) / 2,
        })
    }

    /// `scale=...,pad=...,setsar=1`
    pub fn filter(&self, color: &str) -> String {
        format!(
            "scale={}:{},pad={}:{}:{}:{}:color={},setsar=1",
            self.scaled_width,
            self.scaled_height,
            self.canvas_width,
            self.canvas_height,
            self.pad_x,
            self.pad_y,
            color
        )
    }
}

/// Scale to cover `target` and crop the overflow, centered.
pub fn cover_filter(target: Resolution) -> String {
    let width = even_floor(target.width);
    let height = even_floor(target.height);
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
        w = width,
        h = height
    )
}

fn check_dims(label: &str, res: Resolution) -> MediaResult<()> {
    if res.width < 2 || res.height < 2 {
        return Err(MediaError::invalid_geometry(format!(
            "{} resolution {} is too small",
            label, res
        )));
    }
    Ok(())
}
