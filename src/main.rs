pub mod types;
pub mod config;
pub mod logging;
pub mod data;
pub mod reproject;
pub mod join;
pub mod simplify;
pub mod geojson_out;
pub mod colorscale;
pub mod render;

use anyhow::{Context, Result, bail};
use clap::Parser;
use colorscale::StepColorScale;
use config::AppConfig;
use logging::Stage;
use std::path::PathBuf;
use tracing::{debug, info};
use types::{AttributeTable, GeometryTable, number_or_zero};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration; built-in defaults are used when the file does not exist
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// -v for debug output, -vv for everything
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);
    debug!(?cli, "parsed arguments");

    let total = Stage::start("Generating ADA choropleth");
    let app_config = AppConfig::load_or_default(&cli.config)?;

    // 1. Load CSV
    Stage::start("Loading CSV");
    let attributes = data::load_attributes(&app_config.input)?;

    // 2. Load shapefile and reproject
    Stage::start("Loading shapefile");
    let geometries = data::load_geometries(&app_config.input)?;

    let html = build_map(&app_config, geometries, &attributes)?;
    render::write_map(&html, &app_config.output.html)?;

    info!("Total runtime: {:.1}s", total.elapsed_secs());
    Ok(())
}

/// Stages 3-6: join, simplify, serialize, style and render. Returns the HTML document.
pub fn build_map(app_config: &AppConfig, geometries: GeometryTable, attributes: &AttributeTable) -> Result<String> {
    let input = &app_config.input;

    // 3. Merge
    Stage::start("Merging data");
    let mut joined = join::inner_join(geometries, attributes, &input.join_column_shape, &input.join_column_csv)?;
    if joined.is_empty() {
        bail!("No areas matched between the shapefile and the CSV");
    }

    // 4. Simplify geometries
    let stage = Stage::start("Simplifying geometries (outside major cities)");
    simplify::simplify_outside_cities(
        &mut joined.features,
        &input.name_column,
        &app_config.processing.major_cities,
        app_config.processing.simplify_tolerance,
    );
    info!("Simplification done in {:.1}s", stage.elapsed_secs());

    // 5. GeoJSON
    let stage = Stage::start("Serializing to GeoJSON");
    let collection = geojson_out::to_feature_collection(&joined);
    info!("Serialized {} features in {:.1}s", collection.features.len(), stage.elapsed_secs());
    if let Some(path) = &app_config.output.geojson {
        geojson_out::write_geojson(&collection, path)?;
        info!("GeoJSON saved to {:?}", path);
    }

    // 6. Color scale and map
    Stage::start("Building map");
    let values: Vec<f64> = joined.features.iter()
        .map(|f| number_or_zero(f.properties.get(&input.target_column)))
        .collect();
    let scale = StepColorScale::from_quantiles(&app_config.style.palette, &values, &app_config.style.quantiles)
        .context("Failed to build color scale")?;
    debug!("Color breaks: {:?}", scale.breaks());

    render::render_map(&collection, &scale, &app_config.style, &app_config.map, &input.target_column)
}
