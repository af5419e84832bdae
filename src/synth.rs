//! 学習データのブートストラップ用ダミー画像生成
//!
//! ランダムな背景色に、カテゴリ毎に決まった帯模様と数個のランダム図形を描いた
//! PNG を作成し、マニフェストCSVを書き出します。

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::categories::CATEGORIES;
use crate::error::Result;

/// 画像の出力サブディレクトリ
pub const IMAGES_DIR: &str = "images";

/// 生成設定
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    pub base_dir: PathBuf,
    pub per_category: usize,
    pub image_size: u32,
    pub seed: u64,
}

/// 生成結果
#[derive(Debug, Clone)]
pub struct GeneratedDataset {
    pub manifest_path: PathBuf,
    pub num_images: usize,
}

impl SyntheticDataset {
    pub fn new(base_dir: impl Into<PathBuf>, per_category: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            per_category,
            image_size: 224,
            seed: 42,
        }
    }

    pub fn with_image_size(mut self, image_size: u32) -> Self {
        self.image_size = image_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// マニフェストのパス（ディレクトリ名に `dataset` を含む場合は `dataset.csv`）
    pub fn manifest_path(&self) -> PathBuf {
        let is_dataset = self
            .base_dir
            .file_name()
            .map(|name| name.to_string_lossy().contains("dataset"))
            .unwrap_or(false);
        self.base_dir
            .join(if is_dataset { "dataset.csv" } else { "train.csv" })
    }

    /// 画像とマニフェストを書き出す
    pub fn generate(&self) -> Result<GeneratedDataset> {
        std::fs::create_dir_all(self.base_dir.join(IMAGES_DIR))?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let manifest_path = self.manifest_path();
        let mut writer = csv::Writer::from_path(&manifest_path)?;
        writer.write_record(["image_name", "category"])?;

        let mut num_images = 0;
        for (class_id, category) in CATEGORIES.iter().enumerate() {
            for i in 0..self.per_category {
                let image_name = format!(
                    "{IMAGES_DIR}/{}_{i:03}.png",
                    category.to_lowercase().replace(' ', "_")
                );
                let image = render_image(&mut rng, class_id, self.image_size);
                image.save(self.base_dir.join(&image_name))?;
                writer.write_record([image_name.as_str(), *category])?;
                num_images += 1;
            }
        }
        writer.flush()?;

        tracing::info!(
            "{} 枚の画像と {} を生成しました",
            num_images,
            manifest_path.display()
        );
        Ok(GeneratedDataset {
            manifest_path,
            num_images,
        })
    }
}

fn random_color(rng: &mut StdRng) -> Rgb<u8> {
    Rgb([rng.gen(), rng.gen(), rng.gen()])
}

/// カテゴリ固有の帯（中央に縦縞 `class_id + 1` 本）
fn draw_banner(image: &mut RgbImage, class_id: usize) {
    let (width, height) = image.dimensions();
    let band_height = (height / 8).max(2);
    let top = (height - band_height) / 2;
    let stripes = class_id as u32 + 1;
    let stripe_width = (width / (2 * stripes + 1)).max(1);

    for y in top..top + band_height {
        for x in 0..width {
            let on_stripe = (x / stripe_width) % 2 == 1 && x / stripe_width < 2 * stripes + 1;
            let color = if on_stripe { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) };
            image.put_pixel(x, y, color);
        }
    }
}

fn draw_line(
    image: &mut RgbImage,
    from: (u32, u32),
    to: (u32, u32),
    thickness: u32,
    color: Rgb<u8>,
) {
    let (width, height) = image.dimensions();
    let (x0, y0) = (from.0 as f32, from.1 as f32);
    let (x1, y1) = (to.0 as f32, to.1 as f32);
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1.0) as u32;

    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        let cx = (x0 + (x1 - x0) * t) as u32;
        let cy = (y0 + (y1 - y0) * t) as u32;
        for dy in 0..thickness {
            for dx in 0..thickness {
                let (x, y) = (cx + dx, cy + dy);
                if x < width && y < height {
                    image.put_pixel(x, y, color);
                }
            }
        }
    }
}

fn fill_rect(image: &mut RgbImage, min: (u32, u32), max: (u32, u32), color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    for y in min.1..max.1.min(height) {
        for x in min.0..max.0.min(width) {
            image.put_pixel(x, y, color);
        }
    }
}

fn fill_ellipse(image: &mut RgbImage, min: (u32, u32), max: (u32, u32), color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    let cx = (min.0 + max.0) as f32 / 2.0;
    let cy = (min.1 + max.1) as f32 / 2.0;
    let rx = ((max.0 - min.0) as f32 / 2.0).max(0.5);
    let ry = ((max.1 - min.1) as f32 / 2.0).max(0.5);

    for y in min.1..max.1.min(height) {
        for x in min.0..max.0.min(width) {
            let nx = (x as f32 + 0.5 - cx) / rx;
            let ny = (y as f32 + 0.5 - cy) / ry;
            if nx * nx + ny * ny <= 1.0 {
                image.put_pixel(x, y, color);
            }
        }
    }
}

/// ダミー画像を1枚描画
pub fn render_image(rng: &mut StdRng, class_id: usize, size: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(size, size, random_color(rng));

    for _ in 0..rng.gen_range(1..=3) {
        let a = (rng.gen_range(0..size), rng.gen_range(0..size));
        let b = (rng.gen_range(0..size), rng.gen_range(0..size));
        let min = (a.0.min(b.0), a.1.min(b.1));
        let max = (a.0.max(b.0), a.1.max(b.1));
        let color = random_color(rng);

        match rng.gen_range(0..3) {
            0 => draw_line(&mut image, a, b, rng.gen_range(1..=3), color),
            1 => fill_rect(&mut image, min, max, color),
            _ => fill_ellipse(&mut image, min, max, color),
        }
    }

    draw_banner(&mut image, class_id);
    image
}

/// 既定の2セット（`dataset/` 10枚/カテゴリ、`training/` 50枚/カテゴリ）を生成
pub fn generate_default_sets(
    root: &Path,
    image_size: u32,
    seed: u64,
) -> Result<Vec<GeneratedDataset>> {
    [("dataset", 10), ("training", 50)]
        .into_iter()
        .enumerate()
        .map(|(i, (dir, per_category))| {
            SyntheticDataset::new(root.join(dir), per_category)
                .with_image_size(image_size)
                .with_seed(seed + i as u64)
                .generate()
        })
        .collect()
}
