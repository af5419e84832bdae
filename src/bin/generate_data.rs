//! 学習用ダミーデータ生成
//!
//! 既定では `<root>/dataset`（10枚/カテゴリ）と `<root>/training`（50枚/カテゴリ）を作成します。

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use issue_classifier_lib::synth::{generate_default_sets, SyntheticDataset};

#[derive(Parser, Debug)]
#[command(name = "generate_data", about = "Generate placeholder issue report images")]
struct Args {
    /// 出力先ルート
    #[arg(long, default_value = "model")]
    root: PathBuf,

    /// 1ディレクトリのみ生成する場合の出力先（`--root` 配下の既定2セットの代わり）
    #[arg(long)]
    output: Option<PathBuf>,

    /// `--output` 指定時のカテゴリ毎の枚数
    #[arg(long, default_value_t = 20)]
    per_category: usize,

    /// 画像サイズ（正方形）
    #[arg(long, default_value_t = 224)]
    image_size: u32,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    issue_classifier_lib::init_tracing();
    let args = Args::parse();

    let generated = match args.output {
        Some(output) => vec![SyntheticDataset::new(output, args.per_category)
            .with_image_size(args.image_size)
            .with_seed(args.seed)
            .generate()?],
        None => generate_default_sets(&args.root, args.image_size, args.seed)?,
    };

    for set in generated {
        println!("Generated {} images and {}", set.num_images, set.manifest_path.display());
    }
    Ok(())
}
