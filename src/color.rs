use std::collections::HashMap;

use image::Rgb;

/// 相邻 ID 之间的色相步长（OpenCV 半角刻度，0..180）
const HUE_STEP: u64 = 50;
const HUE_RANGE: u64 = 180;

/// 为每个跟踪 ID 分配固定颜色，保证同一 ID 在整个视频中颜色一致
#[derive(Debug, Default)]
pub struct IdentityColorMap {
    colors: HashMap<u64, Rgb<u8>>,
}

impl IdentityColorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_for(&mut self, identity: u64) -> Rgb<u8> {
        *self
            .colors
            .entry(identity)
            .or_insert_with(|| identity_color(identity))
    }

    /// 已分配颜色的 ID 数量
    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

/// 由 ID 推导鲜艳颜色：色相按 ID 跳变，饱和度和亮度取最大值。
/// 每 18 个 ID 色相循环一次。
pub fn identity_color(identity: u64) -> Rgb<u8> {
    let hue = (identity % HUE_RANGE) * HUE_STEP % HUE_RANGE;
    hsv_to_rgb(hue as f32 * 2.0, 1.0, 1.0)
}

/// HSV（色相单位为度）转 RGB
pub fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Rgb<u8> {
    let h = hue.rem_euclid(360.0) / 60.0;
    let c = value * saturation;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = value - c;

    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}
