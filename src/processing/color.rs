use image::{Rgb, RgbImage, RgbaImage};

/// One entry of a fixed device palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteEntry {
    pub rgb: [u8; 3],
    /// Nibble the panel controller expects for this color.
    pub code: u8,
}

/// Spectra 6 panel colors and their controller codes (4 is unused by the panel).
pub const SPECTRA6: [PaletteEntry; 6] = [
    PaletteEntry { rgb: [0, 0, 0], code: 0x0 },
    PaletteEntry { rgb: [255, 255, 255], code: 0x1 },
    PaletteEntry { rgb: [255, 255, 0], code: 0x2 },
    PaletteEntry { rgb: [255, 0, 0], code: 0x3 },
    PaletteEntry { rgb: [0, 0, 255], code: 0x5 },
    PaletteEntry { rgb: [0, 255, 0], code: 0x6 },
];

const SPECTRA6_PAD: u8 = 0x1;

/// Packs 8-bit RGB into RGB565 using the top 5/6/5 bits of each channel.
pub const fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Converts packed RGB888 bytes into little-endian RGB565 bytes.
pub fn encode_rgb565_le(rgb: &[u8]) -> Vec<u8> {
    let words: Vec<u16> = rgb
        .chunks_exact(3)
        .map(|p| rgb565(p[0], p[1], p[2]).to_le())
        .collect();
    bytemuck::cast_slice(&words).to_vec()
}

/// Index of the palette entry closest to `rgb` (squared sRGB distance, first wins ties).
pub fn nearest_index(palette: &[PaletteEntry], rgb: [i32; 3]) -> usize {
    let mut best = 0;
    let mut best_dist = i64::MAX;
    for (idx, entry) in palette.iter().enumerate() {
        let dist: i64 = (0..3)
            .map(|c| {
                let d = i64::from(rgb[c]) - i64::from(entry.rgb[c]);
                d * d
            })
            .sum();
        if dist < best_dist {
            best = idx;
            best_dist = dist;
        }
    }
    best
}

/// Maps every pixel to a Spectra 6 code and packs two pixels per byte,
/// high nibble first. With `dither`, quantization error is diffused
/// Floyd–Steinberg style.
pub fn encode_spectra6(image: &RgbImage, dither: bool) -> Vec<u8> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let codes = if dither {
        quantize_dithered(image, &SPECTRA6)
    } else {
        image
            .pixels()
            .map(|Rgb(p)| {
                let idx = nearest_index(&SPECTRA6, [p[0].into(), p[1].into(), p[2].into()]);
                SPECTRA6[idx].code
            })
            .collect()
    };

    let row_bytes = w.div_ceil(2);
    let mut out = Vec::with_capacity(row_bytes * h);
    for row in codes.chunks_exact(w.max(1)).take(h) {
        for pair in row.chunks(2) {
            let hi = pair[0];
            let lo = pair.get(1).copied().unwrap_or(SPECTRA6_PAD);
            out.push((hi << 4) | lo);
        }
    }
    out
}

fn quantize_dithered(image: &RgbImage, palette: &[PaletteEntry]) -> Vec<u8> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut work: Vec<[i32; 3]> = image
        .pixels()
        .map(|Rgb(p)| [p[0].into(), p[1].into(), p[2].into()])
        .collect();
    let mut codes = Vec::with_capacity(w * h);

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let px = work[i].map(|c| c.clamp(0, 255));
            let idx = nearest_index(palette, px);
            let chosen = palette[idx].rgb;
            codes.push(palette[idx].code);

            let err = [
                px[0] - i32::from(chosen[0]),
                px[1] - i32::from(chosen[1]),
                px[2] - i32::from(chosen[2]),
            ];
            let mut spread = |nx: usize, ny: usize, weight: i32| {
                let j = ny * w + nx;
                for c in 0..3 {
                    work[j][c] += err[c] * weight / 16;
                }
            };
            if x + 1 < w {
                spread(x + 1, y, 7);
            }
            if y + 1 < h {
                if x > 0 {
                    spread(x - 1, y + 1, 3);
                }
                spread(x, y + 1, 5);
                if x + 1 < w {
                    spread(x + 1, y + 1, 1);
                }
            }
        }
    }
    codes
}

/// Composites `src` over `dst` at (`x`, `y`), honouring source alpha.
pub fn blend_over(dst: &mut RgbImage, src: &RgbaImage, x: u32, y: u32) {
    for (sx, sy, pixel) in src.enumerate_pixels() {
        let (dx, dy) = (x + sx, y + sy);
        if dx >= dst.width() || dy >= dst.height() {
            continue;
        }
        let alpha = u16::from(pixel[3]);
        let out = dst.get_pixel_mut(dx, dy);
        for c in 0..3 {
            let s = u16::from(pixel[c]);
            let d = u16::from(out[c]);
            out[c] = ((s * alpha + d * (255 - alpha) + 127) / 255) as u8;
        }
    }
}
