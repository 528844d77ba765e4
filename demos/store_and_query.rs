// Stores a synthetic ECG recording and reads it back the way a viewer would

use physio_store::core::format::to_datetime;
use physio_store::{
    CorrectionParams, NewSignal, NumericSeries, Result, SampleQuery, SignalData, SignalType,
    Storage, StoreConfig,
};
use tracing::{debug, info, Level};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let root = std::env::temp_dir().join("physio-demo");
    let config = StoreConfig {
        data_root: root.join("chunks"),
        database_path: root.join("catalog.sqlite3"),
        ..StoreConfig::default()
    };
    let storage = Storage::open(&config)?;
    let db = storage.database();

    let dataset = db.create_dataset("demo recording", None)?;
    let signal = db.create_signal(dataset.id, &NewSignal::new("ecg", SignalType::Ecg))?;

    // one hour at 250 Hz
    let start = 1_700_000_000_000_000i64;
    let series = NumericSeries::from_pairs((0..900_000i64).map(|i| {
        let t = i * 4_000;
        (start + t, ((t as f64) / 1e6 * 7.0).sin())
    }));
    let signal = storage.store(&signal, &SignalData::Numeric(series))?;
    info!(
        "Stored {} in {} chunks",
        signal.name,
        db.chunk_count(signal.id)?
    );

    // ten minutes, limited to 500 points
    let query = SampleQuery {
        start: to_datetime(start),
        end: to_datetime(start + 600_000_000),
        max_points: Some(500),
        ..SampleQuery::default()
    };
    let payload = storage.samples(signal.id, &query)?;
    info!(
        "Window: {} points, mode {:?}, bucket {}s",
        payload.data.len(),
        payload.mode,
        payload.window
    );
    for point in payload.data.iter().take(4) {
        debug!("  x={} y={:?}", point.x, point.y);
    }

    // shift the recording by two seconds
    let params = CorrectionParams {
        timeshift: 2.0,
        ..CorrectionParams::default()
    };
    let signal = storage.correct(signal.id, &params)?;
    info!(
        "Corrected range: {:?} .. {:?}",
        signal.first_timestamp, signal.last_timestamp
    );

    storage.delete_dataset_signals(dataset.id)?;
    Ok(())
}
