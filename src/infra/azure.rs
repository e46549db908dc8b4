//! Azure machine templates backed by marketplace or shared gallery images.

use anyhow::Result;
use serde_json::{Value, json};

use crate::catalog::{AzureImage, OsInfo, VersionCatalog};
use crate::error::CuoError;

/// Image block written to `spec.template.spec.image`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureImageSpec {
    pub image: Value,
    pub os_info: OsInfo,
}

impl AzureImageSpec {
    pub(super) fn discriminator(&self) -> String {
        self.image.to_string()
    }

    pub(super) fn matches(&self, template: &Value) -> bool {
        template["spec"]["template"]["spec"]["image"] == self.image
    }

    pub(super) fn apply(&self, machine_spec: &mut Value) {
        machine_spec["image"] = self.image.clone();
    }
}

fn image_block(image: &AzureImage) -> Option<Value> {
    if image.is_marketplace() {
        return Some(json!({
            "marketplace": {
                "publisher": image.publisher,
                "offer": image.offer,
                "sku": image.sku,
                "version": image.version,
                "thirdPartyImage": image.third_party_image,
            }
        }));
    }
    if image.is_shared_gallery() {
        return Some(json!({
            "sharedGallery": {
                "resourceGroup": image.resource_group,
                "name": image.name,
                "subscriptionID": image.subscription_id,
                "gallery": image.gallery,
                "version": image.version,
            }
        }));
    }
    None
}

/// Build the image block from the catalog's Azure image.
pub fn resolve(catalog: &VersionCatalog) -> Result<AzureImageSpec> {
    let image = catalog
        .azure_image
        .as_ref()
        .ok_or_else(|| CuoError::not_found("Azure image", "", &catalog.release_version))?;
    let block = image_block(image).ok_or_else(|| {
        CuoError::not_found(
            "complete marketplace or shared gallery Azure image",
            "",
            &catalog.release_version,
        )
    })?;
    Ok(AzureImageSpec {
        image: block,
        os_info: image.os_info.clone(),
    })
}
