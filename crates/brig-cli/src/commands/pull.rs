use super::EXIT_SUCCESS;
use brig_core::{Context, CoreError, Provider};
use brig_schema::{ContainerInit, ImageRef, ProviderConfig};
use std::path::Path;

pub async fn run(
    ctx: &Context,
    config: ProviderConfig,
    build_root: &Path,
    image: &str,
) -> Result<u8, CoreError> {
    let image = ImageRef::parse(image)?;
    let provider = Provider::new(config, build_root)?;
    let container = provider.new_container(ContainerInit::new(image.clone()))?;

    if container.is_image_cached(ctx).await? {
        println!("{image} already cached");
        return Ok(EXIT_SUCCESS);
    }
    container.pull_image(ctx, None).await?;
    println!("pulled {image}");
    Ok(EXIT_SUCCESS)
}
