//! Raster annotation primitives: straight-alpha blending, blits,
//! rectangles, lines, color ramps, rotation, and text rasterization.

use image::{Rgba, RgbaImage};

use crate::error::{IslError, IslResult};

/// Source-over for straight (non-premultiplied) RGBA8.
pub fn over(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let sa = u32::from(src[3]);
    if sa == 0 {
        return dst;
    }
    if sa == 255 {
        return src;
    }
    let da = u32::from(dst[3]);
    let inv = 255 - sa;
    let out_a = sa + mul_div255(da, inv);
    if out_a == 0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mut out = [0u8; 4];
    for i in 0..3 {
        let sc = u32::from(src[i]) * sa;
        let dc = u32::from(dst[i]) * mul_div255(da, inv);
        out[i] = ((sc + dc + out_a / 2) / out_a) as u8;
    }
    out[3] = out_a as u8;
    Rgba(out)
}

fn mul_div255(x: u32, y: u32) -> u32 {
    (x * y + 127) / 255
}

/// Composite `src` over `dst` at `(x, y)`, clipping to the destination.
pub fn blit_over(dst: &mut RgbaImage, src: &RgbaImage, x: i64, y: i64) {
    let (dw, dh) = (i64::from(dst.width()), i64::from(dst.height()));
    for (sx, sy, px) in src.enumerate_pixels() {
        let tx = x + i64::from(sx);
        let ty = y + i64::from(sy);
        if tx < 0 || ty < 0 || tx >= dw || ty >= dh {
            continue;
        }
        let (tx, ty) = (tx as u32, ty as u32);
        let blended = over(*dst.get_pixel(tx, ty), *px);
        dst.put_pixel(tx, ty, blended);
    }
}

/// Fill the half-open rectangle `[x0, x1) x [y0, y1)`, clipped.
pub fn fill_rect(dst: &mut RgbaImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgba<u8>) {
    let (w, h) = (i64::from(dst.width()), i64::from(dst.height()));
    let x0 = x0.clamp(0, w);
    let x1 = x1.clamp(0, w);
    let y0 = y0.clamp(0, h);
    let y1 = y1.clamp(0, h);
    for y in y0..y1 {
        for x in x0..x1 {
            let blended = over(*dst.get_pixel(x as u32, y as u32), color);
            dst.put_pixel(x as u32, y as u32, blended);
        }
    }
}

/// Stroke the rectangle outline with the given edge thickness.
pub fn draw_rect(
    dst: &mut RgbaImage,
    x0: i64,
    y0: i64,
    x1: i64,
    y1: i64,
    thickness: i64,
    color: Rgba<u8>,
) {
    let t = thickness.max(1);
    fill_rect(dst, x0, y0, x1, y0 + t, color);
    fill_rect(dst, x0, y1 - t, x1, y1, color);
    fill_rect(dst, x0, y0 + t, x0 + t, y1 - t, color);
    fill_rect(dst, x1 - t, y0 + t, x1, y1 - t, color);
}

/// Bresenham line, clipped per pixel.
pub fn draw_line(dst: &mut RgbaImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgba<u8>) {
    let (w, h) = (i64::from(dst.width()), i64::from(dst.height()));
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);
    loop {
        if x >= 0 && y >= 0 && x < w && y < h {
            let blended = over(*dst.get_pixel(x as u32, y as u32), color);
            dst.put_pixel(x as u32, y as u32, blended);
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Paint a color ramp into the rectangle, one even strip per entry.
/// Horizontal ramps run left to right, vertical ramps top to bottom.
pub fn draw_color_ramp(
    dst: &mut RgbaImage,
    x0: i64,
    y0: i64,
    x1: i64,
    y1: i64,
    colors: &[[u8; 4]],
    vertical: bool,
) {
    if colors.is_empty() {
        return;
    }
    let n = colors.len() as i64;
    let span = if vertical { y1 - y0 } else { x1 - x0 };
    for (i, c) in colors.iter().enumerate() {
        let lo = (i as i64) * span / n;
        let hi = (i as i64 + 1) * span / n;
        let color = Rgba(*c);
        if vertical {
            fill_rect(dst, x0, y0 + lo, x1, y0 + hi, color);
        } else {
            fill_rect(dst, x0 + lo, y0, x0 + hi, y1, color);
        }
    }
}

/// Rotate an image counter-clockwise by `degrees` about its center.
/// The result is sized to the rotated bounding box; uncovered pixels
/// are transparent. Nearest-neighbor inverse mapping.
pub fn rotate(src: &RgbaImage, degrees: f64) -> RgbaImage {
    let radians = degrees.to_radians();
    let (sin, cos) = radians.sin_cos();
    let (sw, sh) = (f64::from(src.width()), f64::from(src.height()));

    let out_w = (sw * cos.abs() + sh * sin.abs()).ceil().max(1.0) as u32;
    let out_h = (sw * sin.abs() + sh * cos.abs()).ceil().max(1.0) as u32;

    // Inverse map: output center back to source center, unrotated.
    let inverse = kurbo::Affine::translate((sw / 2.0, sh / 2.0))
        * kurbo::Affine::rotate(radians)
        * kurbo::Affine::translate((
            -f64::from(out_w) / 2.0,
            -f64::from(out_h) / 2.0,
        ));

    let mut out = RgbaImage::from_pixel(out_w, out_h, Rgba([0, 0, 0, 0]));
    for (x, y, px) in out.enumerate_pixels_mut() {
        let p = inverse * kurbo::Point::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
        if p.x >= 0.0 && p.y >= 0.0 && p.x < sw && p.y < sh {
            *px = *src.get_pixel(p.x as u32, p.y as u32);
        }
    }
    out
}

/// RGBA8 brush carried through text layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextBrush {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl From<Rgba<u8>> for TextBrush {
    fn from(c: Rgba<u8>) -> Self {
        Self {
            r: c[0],
            g: c[1],
            b: c[2],
            a: c[3],
        }
    }
}

/// Shapes and rasterizes label text from host-supplied font bytes.
///
/// Hosts that never register a font still run every script; text
/// annotations are skipped with a warning instead of failing.
pub struct TextRasterizer {
    font_ctx: parley::FontContext,
    layout_ctx: parley::LayoutContext<TextBrush>,
    font: Option<LoadedFont>,
}

struct LoadedFont {
    family_name: String,
    font_data: vello_cpu::peniko::FontData,
}

impl Default for TextRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextRasterizer {
    pub fn new() -> Self {
        Self {
            font_ctx: parley::FontContext::default(),
            layout_ctx: parley::LayoutContext::new(),
            font: None,
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Register the font used for all subsequent text rendering.
    pub fn set_font_bytes(&mut self, bytes: Vec<u8>) -> IslResult<()> {
        let families = self
            .font_ctx
            .collection
            .register_fonts(parley::fontique::Blob::from(bytes.clone()), None);
        let family_id = families
            .first()
            .map(|(id, _)| *id)
            .ok_or_else(|| IslError::evaluation("no font families found in font bytes"))?;
        let family_name = self
            .font_ctx
            .collection
            .family_name(family_id)
            .ok_or_else(|| IslError::evaluation("font family has no name"))?
            .to_string();

        let font_data =
            vello_cpu::peniko::FontData::new(vello_cpu::peniko::Blob::from(bytes), 0);
        self.font = Some(LoadedFont {
            family_name,
            font_data,
        });
        Ok(())
    }

    /// Rasterize one line block of text into a tight straight-alpha
    /// image. Returns `None` (with a warning) when no font is loaded or
    /// the text is empty.
    pub fn render(
        &mut self,
        text: &str,
        size_px: f32,
        color: Rgba<u8>,
    ) -> IslResult<Option<RgbaImage>> {
        if text.is_empty() {
            return Ok(None);
        }
        let Some(font) = &self.font else {
            tracing::warn!(text, "no font registered, skipping text annotation");
            return Ok(None);
        };
        if !size_px.is_finite() || size_px <= 0.0 {
            return Err(IslError::evaluation("text size must be finite and > 0"));
        }

        let mut builder = self
            .layout_ctx
            .ranged_builder(&mut self.font_ctx, text, 1.0, true);
        builder.push_default(parley::style::StyleProperty::FontStack(
            parley::style::FontStack::Source(std::borrow::Cow::Owned(
                font.family_name.clone(),
            )),
        ));
        builder.push_default(parley::style::StyleProperty::FontSize(size_px));
        builder.push_default(parley::style::StyleProperty::Brush(TextBrush::from(color)));
        let mut layout: parley::Layout<TextBrush> = builder.build(text);
        layout.break_all_lines(None);

        let width = layout.width().ceil().max(1.0) as u32;
        let height = layout.height().ceil().max(1.0) as u32;
        let w16 = u16::try_from(width)
            .map_err(|_| IslError::evaluation("text raster width exceeds u16"))?;
        let h16 = u16::try_from(height)
            .map_err(|_| IslError::evaluation("text raster height exceeds u16"))?;

        let mut ctx = vello_cpu::RenderContext::new(w16, h16);
        for line in layout.lines() {
            for item in line.items() {
                let parley::layout::PositionedLayoutItem::GlyphRun(run) = item else {
                    continue;
                };
                let brush = run.style().brush;
                ctx.set_paint(vello_cpu::peniko::Color::from_rgba8(
                    brush.r, brush.g, brush.b, brush.a,
                ));
                let glyphs = run.glyphs().map(|g| vello_cpu::Glyph {
                    id: g.id,
                    x: g.x,
                    y: g.y,
                });
                ctx.glyph_run(&font.font_data)
                    .font_size(run.run().font_size())
                    .fill_glyphs(glyphs);
            }
        }
        ctx.flush();

        let mut pixmap = vello_cpu::Pixmap::new(w16, h16);
        ctx.render_to_pixmap(&mut pixmap);
        Ok(Some(premul_to_image(pixmap.data_as_u8_slice(), width, height)))
    }
}

fn premul_to_image(premul: &[u8], width: u32, height: u32) -> RgbaImage {
    let mut out = RgbaImage::new(width, height);
    for (px, chunk) in out.pixels_mut().zip(premul.chunks_exact(4)) {
        let a = u32::from(chunk[3]);
        if a == 0 {
            *px = Rgba([0, 0, 0, 0]);
        } else {
            let un = |c: u8| ((u32::from(c) * 255 + a / 2) / a).min(255) as u8;
            *px = Rgba([un(chunk[0]), un(chunk[1]), un(chunk[2]), a as u8]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_transparent_src_is_noop() {
        let dst = Rgba([10, 20, 30, 40]);
        assert_eq!(over(dst, Rgba([255, 255, 255, 0])), dst);
    }

    #[test]
    fn over_opaque_src_replaces() {
        let src = Rgba([255, 0, 0, 255]);
        assert_eq!(over(Rgba([0, 0, 0, 255]), src), src);
    }

    #[test]
    fn over_half_alpha_mixes() {
        let out = over(Rgba([0, 0, 0, 255]), Rgba([255, 255, 255, 128]));
        assert_eq!(out[3], 255);
        assert!(out[0] > 120 && out[0] < 136);
    }

    #[test]
    fn blit_clips_outside_destination() {
        let mut dst = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        let src = RgbaImage::from_pixel(3, 3, Rgba([255, 0, 0, 255]));
        blit_over(&mut dst, &src, 2, 2);
        assert_eq!(*dst.get_pixel(3, 3), Rgba([255, 0, 0, 255]));
        assert_eq!(*dst.get_pixel(1, 1), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn fill_rect_clamps_bounds() {
        let mut dst = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        fill_rect(&mut dst, -10, -10, 2, 20, Rgba([0, 255, 0, 255]));
        assert_eq!(*dst.get_pixel(1, 3), Rgba([0, 255, 0, 255]));
        assert_eq!(*dst.get_pixel(2, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn line_endpoints_are_painted() {
        let mut dst = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        draw_line(&mut dst, 0, 0, 7, 7, Rgba([255, 255, 255, 255]));
        assert_eq!(*dst.get_pixel(0, 0), Rgba([255, 255, 255, 255]));
        assert_eq!(*dst.get_pixel(7, 7), Rgba([255, 255, 255, 255]));
        assert_eq!(*dst.get_pixel(3, 3), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn ramp_fills_even_strips() {
        let mut dst = RgbaImage::from_pixel(4, 2, Rgba([0, 0, 0, 0]));
        draw_color_ramp(
            &mut dst,
            0,
            0,
            4,
            2,
            &[[255, 0, 0, 255], [0, 0, 255, 255]],
            false,
        );
        assert_eq!(*dst.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(*dst.get_pixel(3, 1), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn rotate_quarter_turn_swaps_dimensions() {
        let mut src = RgbaImage::from_pixel(4, 2, Rgba([0, 0, 255, 255]));
        src.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        let out = rotate(&src, 90.0);
        assert_eq!(out.dimensions(), (2, 4));
    }

    #[test]
    fn rotate_zero_is_identity_sized() {
        let src = RgbaImage::from_pixel(3, 5, Rgba([1, 2, 3, 4]));
        let out = rotate(&src, 0.0);
        assert_eq!(out.dimensions(), (3, 5));
        assert_eq!(*out.get_pixel(1, 1), Rgba([1, 2, 3, 4]));
    }

    #[test]
    fn text_without_font_is_skipped() {
        let mut raster = TextRasterizer::new();
        assert!(!raster.has_font());
        let out = raster.render("hello", 16.0, Rgba([0, 0, 0, 255])).unwrap();
        assert!(out.is_none());
    }
}
