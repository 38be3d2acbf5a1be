//! 学習時のオンザフライ画像拡張
//!
//! 回転・平行移動・ズームをランダムに組み合わせたアフィン変換を、
//! 画像中心を基準に1回だけ適用します。
//! 変換で画像外を参照した画素は最も近い端の画素で埋めます。

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp_with, Interpolation, Projection};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 参照座標は常に画像内に収めるため、実際には使われない
const OUTSIDE: Luma<u8> = Luma([255]);

/// 拡張設定
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationConfig {
    /// 回転角の範囲（度、±）
    pub rotation_range: f32,
    /// 横方向シフトの範囲（幅に対する割合、±）
    pub width_shift_range: f32,
    /// 縦方向シフトの範囲（高さに対する割合、±）
    pub height_shift_range: f32,
    /// ズーム範囲（縦横それぞれ独立に倍率 1±zoom）
    pub zoom_range: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 15.0,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
            zoom_range: 0.1,
        }
    }
}

impl AugmentationConfig {
    /// 拡張なし（恒等変換）
    pub fn none() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            zoom_range: 0.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::none()
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range <= 0.0 {
        0.0
    } else {
        rng.gen_range(-range..=range)
    }
}

/// ランダムなアフィン変換を適用した画像を返す（サイズは入力と同じ）
pub fn augment<R: Rng + ?Sized>(image: &GrayImage, config: &AugmentationConfig, rng: &mut R) -> GrayImage {
    if config.is_identity() {
        return image.clone();
    }

    let (w, h) = (image.width() as f32, image.height() as f32);
    let (cx, cy) = (w / 2.0, h / 2.0);

    let theta = symmetric(rng, config.rotation_range).to_radians();
    let tx = symmetric(rng, config.width_shift_range) * w;
    let ty = symmetric(rng, config.height_shift_range) * h;
    let zoom_x = 1.0 + symmetric(rng, config.zoom_range);
    let zoom_y = 1.0 + symmetric(rng, config.zoom_range);

    // 中心へ移動 -> ズーム -> 回転 -> 元の位置 + シフト
    let projection = Projection::translate(cx + tx, cy + ty)
        * Projection::rotate(theta)
        * Projection::scale(zoom_x, zoom_y)
        * Projection::translate(-cx, -cy);

    // 出力画素 -> 入力座標。端でクランプして最近傍の端画素を使う
    let inverse = projection.invert();
    let (max_x, max_y) = (w - 1.0, h - 1.0);
    warp_with(
        image,
        move |x, y| {
            let (sx, sy) = inverse * (x, y);
            (sx.clamp(0.0, max_x), sy.clamp(0.0, max_y))
        },
        Interpolation::Nearest,
        OUTSIDE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_image() -> GrayImage {
        // 白背景の中央に黒い四角
        GrayImage::from_fn(64, 64, |x, y| {
            if (24..40).contains(&x) && (24..40).contains(&y) {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    #[test]
    fn test_none_is_identity() {
        let image = sample_image();
        let mut rng = StdRng::seed_from_u64(1);
        let out = augment(&image, &AugmentationConfig::none(), &mut rng);
        assert_eq!(out, image);
    }

    #[test]
    fn test_augment_keeps_dimensions() {
        let image = sample_image();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let out = augment(&image, &AugmentationConfig::default(), &mut rng);
            assert_eq!(out.dimensions(), image.dimensions());
        }
    }

    #[test]
    fn test_augment_is_deterministic_for_seed() {
        let image = sample_image();
        let config = AugmentationConfig::default();
        let a = augment(&image, &config, &mut StdRng::seed_from_u64(3));
        let b = augment(&image, &config, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_pure_shift_keeps_center() {
        let image = GrayImage::from_pixel(64, 64, Luma([0]));
        let config = AugmentationConfig {
            rotation_range: 0.0,
            width_shift_range: 0.1,
            height_shift_range: 0.0,
            zoom_range: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let out = augment(&image, &config, &mut rng);

        // 中央は元画像のまま黒
        assert_eq!(out.get_pixel(32, 32), &Luma([0]));
    }

    #[test]
    fn test_uncovered_area_repeats_edge_pixels() {
        // 一様な黒画像はどの変換でも端の画素で埋められ、黒のまま
        let image = GrayImage::from_pixel(64, 64, Luma([0]));
        let config = AugmentationConfig {
            rotation_range: 15.0,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
            zoom_range: 0.1,
        };
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..5 {
            let out = augment(&image, &config, &mut rng);
            assert!(out.pixels().all(|p| p.0[0] == 0));
        }
    }
}
