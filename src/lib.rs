// 絵文字分類器: 学習・評価・推論とHTTPサービス
pub mod ml;
pub mod model;
pub mod server;

/// 推論・評価に使うバックエンド
#[cfg(not(feature = "wgpu"))]
pub type ServeBackend = burn::backend::NdArray;
#[cfg(feature = "wgpu")]
pub type ServeBackend = burn::backend::Wgpu;

/// 学習用バックエンド（自動微分付き）
pub type TrainBackend = burn::backend::Autodiff<ServeBackend>;
