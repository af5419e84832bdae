//! 画像前処理パイプライン
//!
//! 学習と推論で同一の変換を適用します:
//! RGB変換 -> リサイズ (バイリニア) -> [0,1] スケーリング -> チャネル毎の正規化

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::error::Result;

/// モデル入力画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 224;

/// 入力チャネル数
pub const CHANNELS: usize = 3;

/// ImageNetの平均
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNetの標準偏差
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 前処理器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    image_size: usize,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(IMAGE_SIZE)
    }
}

impl Preprocessor {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// テンソル形状 [C, H, W]
    pub fn shape(&self) -> [usize; 3] {
        [CHANNELS, self.image_size, self.image_size]
    }

    /// 画像を正規化済みのデータに変換
    ///
    /// # 戻り値
    /// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
    pub fn process(&self, image: &DynamicImage) -> Vec<f32> {
        let rgb = self.resize(image.to_rgb8());
        let plane = self.image_size * self.image_size;
        let mut data = vec![0.0f32; CHANNELS * plane];

        for (i, pixel) in rgb.pixels().enumerate() {
            for channel in 0..CHANNELS {
                let value = pixel[channel] as f32 / 255.0;
                data[channel * plane + i] = (value - MEAN[channel]) / STD[channel];
            }
        }

        data
    }

    /// 画像ファイルを読み込んで前処理
    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let image = image::open(path)?;
        Ok(self.process(&image))
    }

    /// エンコード済みの画像バイト列をデコードして前処理
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let image = image::load_from_memory(bytes)?;
        Ok(self.process(&image))
    }

    fn resize(&self, rgb: RgbImage) -> RgbImage {
        let size = self.image_size as u32;
        if rgb.dimensions() == (size, size) {
            return rgb;
        }
        image::imageops::resize(&rgb, size, size, FilterType::Triangle)
    }
}

/// 各チャネルの取りうる値域 [(0-mean)/std, (1-mean)/std]
pub fn channel_range(channel: usize) -> (f32, f32) {
    (
        (0.0 - MEAN[channel]) / STD[channel],
        (1.0 - MEAN[channel]) / STD[channel],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbaImage};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_output_shape() {
        let pre = Preprocessor::default();
        let data = pre.process(&gradient(640, 480));
        assert_eq!(data.len(), 3 * 224 * 224);
        assert_eq!(pre.shape(), [3, 224, 224]);
    }

    #[test]
    fn test_values_within_normalized_range() {
        let pre = Preprocessor::default();
        let data = pre.process(&gradient(300, 120));
        let plane = 224 * 224;
        for channel in 0..3 {
            let (lo, hi) = channel_range(channel);
            for v in &data[channel * plane..(channel + 1) * plane] {
                assert!(*v >= lo - 1e-5 && *v <= hi + 1e-5, "{v} not in [{lo}, {hi}]");
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let pre = Preprocessor::default();
        let img = gradient(97, 211);
        assert_eq!(pre.process(&img), pre.process(&img));
    }

    #[test]
    fn test_rgba_and_gray_are_converted() {
        let pre = Preprocessor::new(32);
        let rgba =
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, image::Rgba([255, 0, 0, 0])));
        let data = pre.process(&rgba);
        assert_eq!(data.len(), 3 * 32 * 32);
        // 赤チャネルは最大値、緑は最小値
        assert!((data[0] - channel_range(0).1).abs() < 1e-5);
        assert!((data[32 * 32] - channel_range(1).0).abs() < 1e-5);

        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(5, 7, image::Luma([128])));
        assert_eq!(pre.process(&gray).len(), 3 * 32 * 32);
    }

    #[test]
    fn test_decode_matches_process() {
        let pre = Preprocessor::new(64);
        let img = gradient(80, 80);
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        assert_eq!(pre.decode(&bytes).unwrap(), pre.process(&img));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let pre = Preprocessor::default();
        assert!(pre.decode(b"definitely not an image").is_err());
    }
}
