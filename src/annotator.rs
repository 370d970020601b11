use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use tracing::{info, warn};

use crate::color::IdentityColorMap;
use crate::metadata::{DetectionBox, OccupancySnapshot};

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const CURRENT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TOTAL_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
/// 无 ID 检测框（实时单帧模式）的颜色
const UNTRACKED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

const BOX_THICKNESS: i64 = 2;
const LABEL_PADDING: i64 = 5;
const LABEL_SCALE: f32 = 18.0;
const PANEL_SCALE: f32 = 22.0;
const PANEL_LINE_HEIGHT: i64 = 24;
const PANEL_ORIGIN: (i64, i64) = (10, 10);
const PANEL_SIZE: (i64, i64) = (290, 80);

/// 指定叠加文字字体文件的环境变量
pub const FONT_ENV: &str = "PEOPLE_FLOW_FONT";

/// 未设置 `PEOPLE_FLOW_FONT` 时依次尝试的系统字体
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

static OVERLAY_FONT: OnceLock<Option<Font<'static>>> = OnceLock::new();

/// 读取 TTF/OTF 字体文件
pub fn load_font(path: &Path) -> Option<Font<'static>> {
    let bytes = std::fs::read(path).ok()?;
    Font::try_from_vec(bytes)
}

/// 进程内共享的叠加文字字体，首次调用时查找
///
/// 找不到字体时返回 None，叠加层只画检测框和面板底色。
pub fn overlay_font() -> Option<Font<'static>> {
    OVERLAY_FONT
        .get_or_init(|| {
            let candidates = std::env::var_os(FONT_ENV)
                .map(PathBuf::from)
                .into_iter()
                .chain(FONT_CANDIDATES.iter().map(PathBuf::from));
            for path in candidates {
                if let Some(font) = load_font(&path) {
                    info!("🔤 [标注] 使用字体: {}", path.display());
                    return Some(font);
                }
            }
            warn!(
                "⚠️  [标注] 未找到可用字体，叠加层不绘制文字（可通过 {} 指定）",
                FONT_ENV
            );
            None
        })
        .clone()
}

/// 叠加层的绘制模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    /// 批量视频：显示当前人数、累计人数和进度
    Batch { total_frames: u64 },
    /// 实时单帧：只显示当前人数
    Live,
}

/// 在帧上绘制检测框、ID 标签和人数面板
#[derive(Debug)]
pub struct FrameAnnotator {
    colors: IdentityColorMap,
    font: Option<Font<'static>>,
}

impl Default for FrameAnnotator {
    fn default() -> Self {
        Self::with_font(overlay_font())
    }
}

impl FrameAnnotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font(font: Option<Font<'static>>) -> Self {
        Self {
            colors: IdentityColorMap::new(),
            font,
        }
    }

    pub fn annotate(
        &mut self,
        frame: &mut RgbImage,
        detections: &[DetectionBox],
        snapshot: &OccupancySnapshot,
        mode: OverlayMode,
    ) {
        for det in detections {
            let (color, label) = match det.identity {
                Some(id) => (self.colors.color_for(id), format!("ID:{}", id)),
                None => (UNTRACKED_COLOR, format!("{:.2}", det.confidence)),
            };
            let (x1, y1, x2, y2) = (
                det.x1 as i64,
                det.y1 as i64,
                det.x2 as i64,
                det.y2 as i64,
            );
            draw_outline(frame, x1, y1, x2, y2, color);
            if let Some(font) = &self.font {
                draw_label(frame, font, x1, y1, &label, color);
            }
        }
        self.draw_panel(frame, snapshot, mode);
    }

    pub fn colors(&self) -> &IdentityColorMap {
        &self.colors
    }

    fn draw_panel(&self, frame: &mut RgbImage, snapshot: &OccupancySnapshot, mode: OverlayMode) {
        let (x, y) = PANEL_ORIGIN;
        let (w, h) = match mode {
            OverlayMode::Batch { .. } => PANEL_SIZE,
            OverlayMode::Live => (PANEL_SIZE.0, PANEL_LINE_HEIGHT + 16),
        };
        let (x2, y2) = (x + w - 1, y + h - 1);

        fill_clipped(frame, x, y, x2, y2, BLACK);
        draw_outline(frame, x, y, x2, y2, WHITE);

        let Some(font) = &self.font else {
            return;
        };
        let mut lines = vec![(format!("Current: {}", snapshot.current_count), CURRENT_COLOR)];
        if let OverlayMode::Batch { total_frames } = mode {
            lines.push((format!("Total: {}", snapshot.cumulative_count), TOTAL_COLOR));
            lines.push((
                format!("Progress: {}/{}", snapshot.frame_index, total_frames),
                WHITE,
            ));
        }

        let scale = Scale::uniform(PANEL_SCALE);
        for (i, (text, color)) in lines.iter().enumerate() {
            let line_y = y + 6 + PANEL_LINE_HEIGHT * i as i64;
            draw_text_mut(frame, *color, (x + 10) as i32, line_y as i32, scale, font, text);
        }
    }
}

/// 把闭区间矩形裁剪到画面内，完全在画面外或坐标颠倒时返回 None
///
/// 坐标用 i64 传入，任何 i32 检测框做加减都不会溢出。
fn clip_to_frame(frame: &RgbImage, x1: i64, y1: i64, x2: i64, y2: i64) -> Option<Rect> {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    if x1 > x2 || y1 > y2 || x2 < 0 || y2 < 0 || x1 >= w || y1 >= h {
        return None;
    }
    let (left, top) = (x1.max(0), y1.max(0));
    let (right, bottom) = (x2.min(w - 1), y2.min(h - 1));
    let (width, height) = ((right - left + 1) as u32, (bottom - top + 1) as u32);
    Some(Rect::at(left as i32, top as i32).of_size(width, height))
}

fn fill_clipped(frame: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64, color: Rgb<u8>) {
    if let Some(rect) = clip_to_frame(frame, x1, y1, x2, y2) {
        draw_filled_rect_mut(frame, rect, color);
    }
}

/// 向内加粗的空心矩形，四条边各自裁剪，画面外的边不画
fn draw_outline(frame: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64, color: Rgb<u8>) {
    if x1 > x2 || y1 > y2 {
        return;
    }
    let t = BOX_THICKNESS - 1;
    fill_clipped(frame, x1, y1, x2, y1 + t, color);
    fill_clipped(frame, x1, y2 - t, x2, y2, color);
    fill_clipped(frame, x1, y1, x1 + t, y2, color);
    fill_clipped(frame, x2 - t, y1, x2, y2, color);
}

/// 标签画在框的上方；框贴近顶部时改画在框内
fn draw_label(
    frame: &mut RgbImage,
    font: &Font<'static>,
    x1: i64,
    y1: i64,
    label: &str,
    background: Rgb<u8>,
) {
    let scale = Scale::uniform(LABEL_SCALE);
    let (text_w, text_h) = text_size(scale, font, label);
    let label_h = text_h as i64 + LABEL_PADDING * 2;
    let top = if y1 - label_h >= 0 { y1 - label_h } else { y1 };

    // 标签底色与画面不相交时文字也不会落在画面内
    let right = x1 + text_w.max(1) as i64 - 1;
    let Some(rect) = clip_to_frame(frame, x1, top, right, top + label_h - 1) else {
        return;
    };
    draw_filled_rect_mut(frame, rect, background);
    draw_text_mut(
        frame,
        WHITE,
        x1 as i32,
        (top + LABEL_PADDING) as i32,
        scale,
        font,
        label,
    );
}
