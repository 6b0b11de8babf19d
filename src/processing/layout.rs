/// Where a scaled source image lands on the target canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

/// Scales `src` to fit inside `canvas` without changing its aspect ratio.
///
/// A relatively wider source is matched to the canvas width and its height
/// becomes `floor(canvas_w / aspect)`; otherwise it is matched to the canvas
/// height and its width becomes `floor(canvas_h * aspect)`. Aspect ratios are
/// compared by cross-multiplication so the result is exact.
pub fn fit_dimensions(src_w: u32, src_h: u32, canvas_w: u32, canvas_h: u32) -> (u32, u32) {
    let iw = u64::from(src_w.max(1));
    let ih = u64::from(src_h.max(1));
    let cw = u64::from(canvas_w.max(1));
    let ch = u64::from(canvas_h.max(1));
    if iw * ch > cw * ih {
        let h = (cw * ih / iw).clamp(1, ch);
        (cw as u32, h as u32)
    } else {
        let w = (ch * iw / ih).clamp(1, cw);
        (w as u32, ch as u32)
    }
}

pub fn center_offset(inner_w: u32, inner_h: u32, outer_w: u32, outer_h: u32) -> (u32, u32) {
    let ox = outer_w.saturating_sub(inner_w) / 2;
    let oy = outer_h.saturating_sub(inner_h) / 2;
    (ox, oy)
}

pub fn place(src_w: u32, src_h: u32, canvas_w: u32, canvas_h: u32) -> Placement {
    let (width, height) = fit_dimensions(src_w, src_h, canvas_w, canvas_h);
    let (x, y) = center_offset(width, height, canvas_w, canvas_h);
    Placement {
        width,
        height,
        x,
        y,
    }
}
