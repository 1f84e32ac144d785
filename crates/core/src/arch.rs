//! Architectures, user configuration, and stage resolution.
//!
//! Every architecture maps to a fixed set of geometric constants. They are
//! resolved once into a list of [`PipelineStage`]s before any tile work starts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::UpscaleError;
use crate::padding::PaddingMode;
use crate::planner::{plan_overlap_tiles, plan_tiles, TilingPlan, BLEND_SIZE};

/// Tile edge the real_esrgan models are exported with.
const REAL_ESRGAN_TILE: usize = 128;
/// Context margin cut from each side of a real_esrgan tile.
const REAL_ESRGAN_OVERLAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    SwinUnet,
    Cunet,
    RealEsrgan,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SwinUnet => "swin_unet",
            Self::Cunet => "cunet",
            Self::RealEsrgan => "real_esrgan",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "swin_unet" | "swinunet" | "a" => Ok(Self::SwinUnet),
            "cunet" | "b" => Ok(Self::Cunet),
            "real_esrgan" | "realesrgan" | "c" => Ok(Self::RealEsrgan),
            other => bail!("unknown architecture '{other}' (expected swin_unet, cunet or real_esrgan)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    Art,
    ArtScan,
    Photo,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Art => "art",
            Self::ArtScan => "art_scan",
            Self::Photo => "photo",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Style {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "art" => Ok(Self::Art),
            "art_scan" => Ok(Self::ArtScan),
            "photo" => Ok(Self::Photo),
            other => bail!("unknown style '{other}' (expected art, art_scan or photo)"),
        }
    }
}

/// Denoise strength. `-1` (or `none`) disables denoising; `0..=3` are levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum NoiseLevel {
    #[default]
    None,
    Level(u8),
}

impl NoiseLevel {
    pub const MAX: u8 = 3;

    pub fn level(&self) -> Option<u8> {
        match self {
            Self::None => None,
            Self::Level(n) => Some(*n),
        }
    }
}

impl TryFrom<i8> for NoiseLevel {
    type Error = String;

    fn try_from(value: i8) -> std::result::Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::None),
            0..=3 => Ok(Self::Level(value as u8)),
            other => Err(format!("noise level {other} out of range (-1 for none, or 0..=3)")),
        }
    }
}

impl From<NoiseLevel> for i8 {
    fn from(value: NoiseLevel) -> Self {
        match value {
            NoiseLevel::None => -1,
            NoiseLevel::Level(n) => n as i8,
        }
    }
}

impl fmt::Display for NoiseLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Level(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for NoiseLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("none") {
            return Ok(Self::None);
        }
        let value: i8 = trimmed
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid noise level '{trimmed}'"))?;
        Self::try_from(value).map_err(anyhow::Error::msg)
    }
}

/// User-facing upscale options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleConfig {
    pub architecture: Architecture,
    pub style: Style,
    pub noise: NoiseLevel,
    pub scale: usize,
    pub tile_size: usize,
    /// Seam overlap in output pixels for blended stages.
    pub blend_size: usize,
    /// Upper bound on bytes held by one in-flight tile (input plus output).
    pub memory_budget: Option<u64>,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::SwinUnet,
            style: Style::Art,
            noise: NoiseLevel::None,
            scale: 2,
            tile_size: 64,
            blend_size: BLEND_SIZE,
            memory_budget: None,
        }
    }
}

/// Maps a requested tile size onto one the model kernels accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TileSizeRule {
    /// `(t - 16)` must be a multiple of both 12 and 16.
    SwinUnet,
    /// Grow by the input-space context, then round down to a multiple of 4.
    Cunet { offset: usize, scale: usize },
    Fixed(usize),
}

impl TileSizeRule {
    pub fn apply(&self, requested: usize) -> usize {
        match *self {
            Self::SwinUnet => {
                let mut tile = requested.max(16);
                while (tile - 16) % 12 != 0 || (tile - 16) % 16 != 0 {
                    tile += 1;
                }
                tile
            }
            Self::Cunet { offset, scale } => {
                let tile = requested + 2 * offset.div_ceil(scale.max(1));
                (tile - tile % 4).max(4)
            }
            Self::Fixed(size) => size,
        }
    }
}

/// Per-stage geometric constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scheduler", rename_all = "snake_case")]
pub enum StageGeometry {
    /// Seam-blended tiles with a model that drops `offset` border pixels.
    Blended {
        scale: usize,
        offset: usize,
        padding: PaddingMode,
        tile_rule: TileSizeRule,
        blend_size: usize,
    },
    /// Tiles overlap by `overlap` input pixels, trimmed before a direct paste.
    OverlapCrop {
        scale: usize,
        overlap: usize,
        padding: PaddingMode,
        tile_rule: TileSizeRule,
    },
}

impl StageGeometry {
    pub fn scale(&self) -> usize {
        match self {
            Self::Blended { scale, .. } | Self::OverlapCrop { scale, .. } => *scale,
        }
    }

    pub fn padding(&self) -> PaddingMode {
        match self {
            Self::Blended { padding, .. } | Self::OverlapCrop { padding, .. } => *padding,
        }
    }

    pub fn tile_rule(&self) -> TileSizeRule {
        match self {
            Self::Blended { tile_rule, .. } | Self::OverlapCrop { tile_rule, .. } => *tile_rule,
        }
    }

    /// Smallest requested tile that still produces a multi-tile grid.
    pub fn minimum_tile(&self) -> usize {
        match *self {
            Self::Blended {
                scale,
                offset,
                blend_size,
                ..
            } => crate::planner::minimum_viable_tile(scale, offset, blend_size),
            Self::OverlapCrop { overlap, .. } => 2 * overlap + 1,
        }
    }

    /// Plans an image of `height x width` with an already rule-adjusted tile.
    pub fn plan(&self, height: usize, width: usize, tile_size: usize) -> Result<TilingPlan> {
        match *self {
            Self::Blended {
                scale,
                offset,
                blend_size,
                ..
            } => plan_tiles(height, width, scale, offset, tile_size, blend_size),
            Self::OverlapCrop { scale, overlap, .. } => {
                plan_overlap_tiles(height, width, scale, tile_size, overlap)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Noise(u8),
    Scale(usize),
    NoiseScale(u8, usize),
}

impl ModelKind {
    fn file_stem(&self) -> String {
        match self {
            Self::Noise(level) => format!("noise{level}"),
            Self::Scale(scale) => format!("scale{scale}x"),
            Self::NoiseScale(level, scale) => format!("noise{level}_scale{scale}x"),
        }
    }
}

/// Identity of one model file; also the model cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ModelId {
    pub architecture: Architecture,
    pub style: Style,
    pub kind: ModelKind,
}

impl ModelId {
    /// Path of the model below the models directory.
    pub fn relative_path(&self) -> PathBuf {
        match (self.architecture, self.kind) {
            (Architecture::RealEsrgan, ModelKind::Scale(scale)) => {
                PathBuf::from(self.architecture.as_str()).join(format!("x{scale}.onnx"))
            }
            _ => PathBuf::from(self.architecture.as_str())
                .join(self.style.as_str())
                .join(format!("{}.onnx", self.kind.file_stem())),
        }
    }

    pub fn name(&self) -> String {
        match (self.architecture, self.kind) {
            (Architecture::RealEsrgan, ModelKind::Scale(scale)) => format!("x{scale}"),
            _ => self.kind.file_stem(),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.architecture {
            Architecture::RealEsrgan => write!(f, "{}/{}", self.architecture, self.name()),
            _ => write!(f, "{}/{}/{}", self.architecture, self.style, self.name()),
        }
    }
}

/// Model file located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    pub id: ModelId,
    pub path: PathBuf,
}

/// Maps model ids to files below a models directory.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    models_dir: PathBuf,
}

impl ModelResolver {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn resolve(&self, id: &ModelId) -> ModelHandle {
        ModelHandle {
            id: *id,
            path: self.models_dir.join(id.relative_path()),
        }
    }
}

/// One inference pass over the whole image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStage {
    pub name: String,
    pub model: ModelId,
    pub geometry: StageGeometry,
}

impl PipelineStage {
    fn new(model: ModelId, geometry: StageGeometry) -> Self {
        Self {
            name: model.name(),
            model,
            geometry,
        }
    }
}

fn swin_unet_offset(scale: usize) -> usize {
    match scale {
        1 => 8,
        2 => 16,
        _ => 32,
    }
}

fn cunet_offset(scale: usize) -> usize {
    if scale == 1 {
        28
    } else {
        36
    }
}

fn swin_unet_stage(style: Style, kind: ModelKind, scale: usize, blend_size: usize) -> PipelineStage {
    let id = ModelId {
        architecture: Architecture::SwinUnet,
        style,
        kind,
    };
    let geometry = StageGeometry::Blended {
        scale,
        offset: swin_unet_offset(scale),
        padding: PaddingMode::Replicate,
        tile_rule: TileSizeRule::SwinUnet,
        blend_size,
    };
    PipelineStage::new(id, geometry)
}

fn cunet_stage(kind: ModelKind, scale: usize, blend_size: usize) -> PipelineStage {
    let id = ModelId {
        architecture: Architecture::Cunet,
        style: Style::Art,
        kind,
    };
    let offset = cunet_offset(scale);
    let geometry = StageGeometry::Blended {
        scale,
        offset,
        padding: PaddingMode::Mirror,
        tile_rule: TileSizeRule::Cunet { offset, scale },
        blend_size,
    };
    PipelineStage::new(id, geometry)
}

/// Resolves the ordered stage list for `config`.
///
/// An empty list means there is nothing to do: scale 1 without denoising.
pub fn resolve_stages(config: &UpscaleConfig) -> Result<Vec<PipelineStage>> {
    let scale = config.scale;
    if !matches!(scale, 1 | 2 | 4) {
        return Err(UpscaleError::config(format!("scale {scale} is not supported (expected 1, 2 or 4)")).into());
    }
    let noise = config.noise.level();
    if let Some(level) = noise {
        if level > NoiseLevel::MAX {
            return Err(UpscaleError::config(format!("noise level {level} is out of range")).into());
        }
    }
    if scale == 1 && noise.is_none() {
        return Ok(Vec::new());
    }

    let blend = config.blend_size;
    let mut stages = Vec::new();
    match config.architecture {
        Architecture::SwinUnet => {
            if let Some(level) = noise {
                stages.push(swin_unet_stage(config.style, ModelKind::Noise(level), 1, blend));
            }
            if scale > 1 {
                stages.push(swin_unet_stage(config.style, ModelKind::Scale(scale), scale, blend));
            }
        }
        Architecture::Cunet => {
            if config.style != Style::Art {
                debug!(style = %config.style, "cunet only ships art models; using art");
            }
            let first = match (noise, scale) {
                (Some(level), 1) => cunet_stage(ModelKind::Noise(level), 1, blend),
                (Some(level), _) => cunet_stage(ModelKind::NoiseScale(level, 2), 2, blend),
                (None, _) => cunet_stage(ModelKind::Scale(2), 2, blend),
            };
            stages.push(first);
            if scale == 4 {
                stages.push(cunet_stage(ModelKind::Scale(2), 2, blend));
            }
        }
        Architecture::RealEsrgan => {
            if let Some(level) = noise {
                return Err(UpscaleError::config(format!(
                    "real_esrgan has no denoise models (requested noise level {level})"
                ))
                .into());
            }
            let id = ModelId {
                architecture: Architecture::RealEsrgan,
                style: config.style,
                kind: ModelKind::Scale(scale),
            };
            let geometry = StageGeometry::OverlapCrop {
                scale,
                overlap: REAL_ESRGAN_OVERLAP,
                padding: PaddingMode::Mirror,
                tile_rule: TileSizeRule::Fixed(REAL_ESRGAN_TILE),
            };
            stages.push(PipelineStage::new(id, geometry));
        }
    }

    debug!(
        architecture = %config.architecture,
        scale,
        noise = %config.noise,
        stages = ?stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "Resolved pipeline stages"
    );
    Ok(stages)
}
