use crate::config::UploadConfig;
use crate::services::image_tool::ImageMagick;
use crate::services::pipeline::ProcessingPipeline;
use crate::services::probe::{IdentifyProbe, MetadataProbe};
use crate::services::versions::VersionGenerator;
use std::sync::Arc;
use tracing::{info, warn};

/// Wires the ImageMagick-backed pipeline and prepares the upload directories.
pub async fn setup_pipeline(config: Arc<UploadConfig>) -> anyhow::Result<Arc<ProcessingPipeline>> {
    tokio::fs::create_dir_all(config.upload_dir()).await?;
    tokio::fs::create_dir_all(&config.tmp_dir).await?;

    let magick = ImageMagick::new(config.imagemagick_path.clone());

    let wants_magick =
        config.identify || (config.image_types.is_some() && !config.image_versions.is_empty());
    if wants_magick {
        if magick.health_check().await {
            info!("🖼️  ImageMagick available");
        } else {
            warn!("⚠️  ImageMagick unreachable! Image versions will fail and metadata stays empty.");
        }
    }

    // Only consulted when identification is switched on, globally or per version.
    let probe: Arc<dyn MetadataProbe> = Arc::new(IdentifyProbe::new(magick.clone()));
    let generator = VersionGenerator::new(Arc::new(magick), probe.clone(), config.identify);

    Ok(Arc::new(ProcessingPipeline::new(config, probe, generator)))
}
