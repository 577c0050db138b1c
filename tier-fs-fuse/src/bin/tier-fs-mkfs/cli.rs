use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Host directory packed into the image
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output image file
    #[arg(long, short)]
    pub image: PathBuf,

    /// Image size in sectors
    #[arg(long, short = 'n', default_value_t = 16 * 2048)]
    pub sectors: u32,
}
